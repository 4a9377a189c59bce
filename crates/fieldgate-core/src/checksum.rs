//! Modbus RTU CRC-16.
//!
//! Reflected polynomial 0xA001, seed 0xFFFF, transmitted low byte first.

const SEED: u16 = 0xFFFF;
const POLY: u16 = 0xA001;

/// Compute the CRC-16 of `data`.
///
/// # Examples
///
/// ```
/// use fieldgate_core::checksum::checksum;
///
/// // read 8 input registers from address 1
/// assert_eq!(checksum(&[0x01, 0x04, 0x00, 0x00, 0x00, 0x08]), 0xCCF1);
/// ```
#[must_use]
pub fn checksum(data: &[u8]) -> u16 {
    let mut crc = SEED;
    for &byte in data {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ POLY;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// Return `frame` with its checksum appended, low byte first.
#[must_use]
pub fn append_checksum(frame: &[u8]) -> Vec<u8> {
    let crc = checksum(frame);
    let mut out = Vec::with_capacity(frame.len() + 2);
    out.extend_from_slice(frame);
    out.extend_from_slice(&crc.to_le_bytes());
    out
}

/// Check the trailing checksum of a complete frame.
///
/// Frames shorter than four bytes cannot be valid and return `false`.
#[must_use]
pub fn verify(frame: &[u8]) -> bool {
    if frame.len() < 4 {
        return false;
    }
    let (body, trailer) = frame.split_at(frame.len() - 2);
    checksum(body).to_le_bytes() == [trailer[0], trailer[1]]
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_known_request_checksum() {
        let frame = append_checksum(&[0x01, 0x04, 0x00, 0x00, 0x00, 0x08]);
        assert_eq!(frame, vec![0x01, 0x04, 0x00, 0x00, 0x00, 0x08, 0xF1, 0xCC]);
    }

    #[test]
    fn test_empty_input_is_seed() {
        assert_eq!(checksum(&[]), 0xFFFF);
    }

    #[test]
    fn test_verify_rejects_short_frames() {
        assert!(!verify(&[]));
        assert!(!verify(&[0xFF, 0xFF]));
        assert!(!verify(&[0x01, 0x02, 0x03]));
    }

    #[test]
    fn test_verify_rejects_swapped_bytes() {
        let mut frame = append_checksum(&[0x01, 0x04, 0x00, 0x00, 0x00, 0x08]);
        let n = frame.len();
        frame.swap(n - 1, n - 2);
        assert!(!verify(&frame));
    }

    proptest! {
        #[test]
        fn appended_checksum_verifies(body in proptest::collection::vec(any::<u8>(), 2..64)) {
            prop_assert!(verify(&append_checksum(&body)));
        }

        #[test]
        fn single_bit_flip_is_detected(
            body in proptest::collection::vec(any::<u8>(), 2..64),
            bit in any::<proptest::sample::Index>(),
        ) {
            let mut frame = append_checksum(&body);
            let bit = bit.index(frame.len() * 8);
            frame[bit / 8] ^= 1 << (bit % 8);
            prop_assert!(!verify(&frame));
        }
    }
}
