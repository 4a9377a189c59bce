//! Request framing and response validation for read-input-registers.

use bytes::{BufMut, BytesMut};

use crate::checksum::{append_checksum, verify};
use crate::error::{Error, Result};

/// Modbus function code for reading input registers.
pub const READ_INPUT_REGISTERS: u8 = 0x04;

/// High bit set on the function code of an exception response.
pub const EXCEPTION_FLAG: u8 = 0x80;

/// Length of an exception response: address, function, code, checksum.
pub const EXCEPTION_RESPONSE_LEN: usize = 5;

/// Build a read-input-registers request with its checksum.
///
/// Layout: `[address][0x04][start hi][start lo][count hi][count lo][crc lo][crc hi]`.
#[must_use]
pub fn read_input_registers_request(address: u8, start: u16, count: u16) -> Vec<u8> {
    let mut pdu = BytesMut::with_capacity(6);
    pdu.put_u8(address);
    pdu.put_u8(READ_INPUT_REGISTERS);
    pdu.put_u16(start);
    pdu.put_u16(count);
    append_checksum(&pdu)
}

/// Shortest valid response for `count` registers: header, payload, checksum.
#[must_use]
pub fn min_response_len(count: u16) -> usize {
    5 + 2 * usize::from(count)
}

/// Whether `frame` is a complete exception response from some device.
#[must_use]
pub fn is_exception_response(frame: &[u8]) -> bool {
    frame.len() == EXCEPTION_RESPONSE_LEN && frame[1] & EXCEPTION_FLAG != 0 && verify(frame)
}

/// Validate a response frame against the request it answers.
///
/// Checks run in order: checksum, responding address, function code, then
/// the byte-count field against the frame length.
pub fn validate_response(frame: &[u8], address: u8, function: u8) -> Result<()> {
    if !verify(frame) {
        return Err(Error::ChecksumMismatch {
            frame: frame.to_vec(),
        });
    }
    if frame[0] != address {
        return Err(Error::AddressMismatch {
            expected: address,
            actual: frame[0],
        });
    }
    if frame[1] != function {
        if frame[1] == function | EXCEPTION_FLAG && frame.len() >= EXCEPTION_RESPONSE_LEN {
            return Err(Error::DeviceException { code: frame[2] });
        }
        return Err(Error::FunctionCodeMismatch {
            expected: function,
            actual: frame[1],
        });
    }
    let declared = usize::from(frame[2]);
    if declared + 5 != frame.len() {
        return Err(Error::InvalidResponse(format!(
            "byte count {} does not match {} byte frame",
            declared,
            frame.len()
        )));
    }
    Ok(())
}

/// Register payload of a validated response.
///
/// The byte-count field must equal `2 * count`.
pub fn register_payload(frame: &[u8], count: u16) -> Result<&[u8]> {
    let len = 2 * usize::from(count);
    if let Some(&declared) = frame.get(2)
        && usize::from(declared) != len
    {
        return Err(Error::InvalidResponse(format!(
            "byte count {} for {} registers",
            declared, count
        )));
    }
    frame.get(3..3 + len).ok_or_else(|| {
        Error::InvalidResponse(format!(
            "payload needs {} bytes, frame has {}",
            len,
            frame.len().saturating_sub(5)
        ))
    })
}

/// Build a read-input-registers response carrying `words`.
///
/// Used by the mock transport and by tests that script device replies.
#[must_use]
pub fn read_input_registers_response(address: u8, words: &[u16]) -> Vec<u8> {
    let mut pdu = BytesMut::with_capacity(3 + words.len() * 2);
    pdu.put_u8(address);
    pdu.put_u8(READ_INPUT_REGISTERS);
    pdu.put_u8((words.len() * 2) as u8);
    for &word in words {
        pdu.put_u16(word);
    }
    append_checksum(&pdu)
}

/// Build an exception response for `function` with `code`.
#[must_use]
pub fn exception_response(address: u8, function: u8, code: u8) -> Vec<u8> {
    append_checksum(&[address, function | EXCEPTION_FLAG, code])
}

/// Space-separated uppercase hex, for logs and error messages.
pub fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_layout() {
        let frame = read_input_registers_request(0x01, 0x0000, 8);
        assert_eq!(frame, vec![0x01, 0x04, 0x00, 0x00, 0x00, 0x08, 0xF1, 0xCC]);
    }

    #[test]
    fn test_request_big_endian_fields() {
        let frame = read_input_registers_request(0x11, 0x0102, 0x0304);
        assert_eq!(&frame[..6], &[0x11, 0x04, 0x01, 0x02, 0x03, 0x04]);
        assert!(verify(&frame));
    }

    #[test]
    fn test_min_response_len() {
        assert_eq!(min_response_len(8), 21);
        assert_eq!(min_response_len(1), 7);
    }

    #[test]
    fn test_validate_good_response() {
        let frame = read_input_registers_response(3, &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(frame.len(), 21);
        assert!(validate_response(&frame, 3, READ_INPUT_REGISTERS).is_ok());
    }

    #[test]
    fn test_validate_bad_checksum() {
        let mut frame = read_input_registers_response(3, &[1, 2]);
        frame[4] ^= 0x10;
        assert!(matches!(
            validate_response(&frame, 3, READ_INPUT_REGISTERS),
            Err(Error::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_validate_wrong_address() {
        let frame = read_input_registers_response(4, &[1, 2]);
        assert!(matches!(
            validate_response(&frame, 3, READ_INPUT_REGISTERS),
            Err(Error::AddressMismatch {
                expected: 3,
                actual: 4
            })
        ));
    }

    #[test]
    fn test_validate_exception() {
        let frame = exception_response(3, READ_INPUT_REGISTERS, 0x02);
        assert!(is_exception_response(&frame));
        assert!(matches!(
            validate_response(&frame, 3, READ_INPUT_REGISTERS),
            Err(Error::DeviceException { code: 0x02 })
        ));
    }

    #[test]
    fn test_validate_function_mismatch() {
        let frame = append_checksum(&[3, 0x03, 2, 0, 1]);
        assert!(matches!(
            validate_response(&frame, 3, READ_INPUT_REGISTERS),
            Err(Error::FunctionCodeMismatch {
                expected: 0x04,
                actual: 0x03
            })
        ));
    }

    #[test]
    fn test_register_payload_offsets() {
        let frame = read_input_registers_response(1, &[0x0102, 0x0304]);
        assert_eq!(register_payload(&frame, 2).unwrap(), &[1, 2, 3, 4]);
        assert!(register_payload(&frame, 8).is_err());
    }

    #[test]
    fn test_validate_byte_count() {
        let mut pdu = vec![1, READ_INPUT_REGISTERS, 6];
        pdu.extend_from_slice(&[0, 1, 0, 2]);
        let frame = append_checksum(&pdu);
        assert!(matches!(
            validate_response(&frame, 1, READ_INPUT_REGISTERS),
            Err(Error::InvalidResponse(_))
        ));

        let frame = read_input_registers_response(1, &[1, 2]);
        assert!(validate_response(&frame, 1, READ_INPUT_REGISTERS).is_ok());
        assert!(matches!(
            register_payload(&frame, 3),
            Err(Error::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_hex() {
        assert_eq!(hex(&[0x01, 0xAB, 0x00]), "01 AB 00");
        assert_eq!(hex(&[]), "");
    }
}
