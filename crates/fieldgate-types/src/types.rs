//! Core types for gateway telemetry data.

use core::fmt;
use core::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::ParseError;

/// Number of input registers read from a meter in one exchange.
pub const METER_REGISTER_COUNT: usize = 8;

/// Highest valid field-bus protocol address.
pub const MAX_PROTOCOL_ADDRESS: u8 = 247;

/// Alarm registers read as all-ones when the alarm is raised.
const ALARM_RAISED: u16 = 0xFFFF;

/// Kind of field instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum DeviceKind {
    /// Power or battery meter polled over the field bus.
    Meter,
    /// Weather station pushing telemetry over HTTP.
    #[cfg_attr(feature = "serde", serde(rename = "weather"))]
    WeatherStation,
    /// Anything else recorded by the gateway.
    Other,
}

impl DeviceKind {
    /// Every kind, in upload order.
    pub const ALL: [DeviceKind; 3] = [
        DeviceKind::Meter,
        DeviceKind::WeatherStation,
        DeviceKind::Other,
    ];

    /// Stable string form used in the store and upload envelopes.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceKind::Meter => "meter",
            DeviceKind::WeatherStation => "weather",
            DeviceKind::Other => "other",
        }
    }

    /// Whether devices of this kind are polled by protocol address.
    #[must_use]
    pub fn is_polled(&self) -> bool {
        matches!(self, DeviceKind::Meter)
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for DeviceKind {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "meter" | "battery" | "power" => Ok(DeviceKind::Meter),
            "weather" | "weather_station" => Ok(DeviceKind::WeatherStation),
            "other" => Ok(DeviceKind::Other),
            other => Err(ParseError::UnknownKind(other.to_string())),
        }
    }
}

/// Identity of a field instrument.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Device {
    /// Stable, globally unique external identifier.
    pub id: String,
    /// Protocol address on the shared transport (meters only).
    pub address: Option<u8>,
    pub kind: DeviceKind,
    pub name: String,
    #[cfg_attr(feature = "serde", serde(default))]
    pub model: Option<String>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub location: Option<String>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub description: Option<String>,
    pub enabled: bool,
}

impl Device {
    /// Create an enabled device with no optional metadata.
    pub fn new(id: impl Into<String>, kind: DeviceKind, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: None,
            kind,
            name: name.into(),
            model: None,
            location: None,
            description: None,
            enabled: true,
        }
    }

    /// Set the protocol address.
    #[must_use]
    pub fn with_address(mut self, address: u8) -> Self {
        self.address = Some(address);
        self
    }

    /// Set the installation location.
    #[must_use]
    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    /// Check registry invariants.
    ///
    /// Polled kinds must carry an address in `1..=247`; other kinds must not
    /// carry one at all.
    pub fn validate(&self) -> Result<(), ParseError> {
        if self.id.trim().is_empty() {
            return Err(ParseError::InvalidDevice("id cannot be empty".into()));
        }
        match (self.kind.is_polled(), self.address) {
            (true, None) => Err(ParseError::InvalidDevice(format!(
                "{} device '{}' requires a protocol address",
                self.kind, self.id
            ))),
            (true, Some(addr)) if addr == 0 || addr > MAX_PROTOCOL_ADDRESS => {
                Err(ParseError::InvalidDevice(format!(
                    "protocol address {} out of range 1-{}",
                    addr, MAX_PROTOCOL_ADDRESS
                )))
            }
            (false, Some(_)) => Err(ParseError::InvalidDevice(format!(
                "protocol address is only meaningful for polled devices, not {}",
                self.kind
            ))),
            _ => Ok(()),
        }
    }
}

/// One decoded instantaneous meter reading.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MeterReading {
    /// Volts.
    pub voltage: f64,
    /// Amps.
    pub current: f64,
    /// Watts.
    pub power: f64,
    /// Cumulative kWh.
    pub energy: f64,
    pub alarm_high: bool,
    pub alarm_low: bool,
    /// Set when the decoded power was implausible and replaced with V×I.
    #[cfg_attr(feature = "serde", serde(default, skip_serializing))]
    pub power_substituted: bool,
}

impl MeterReading {
    /// Decode a reading from eight input-register words.
    ///
    /// Word layout:
    /// - 0: voltage (×0.01 V)
    /// - 1: current (×0.01 A)
    /// - 2-3: power, low word first (×0.1 W)
    /// - 4-5: energy, low word first (Wh)
    /// - 6-7: high/low voltage alarms (0xFFFF when raised)
    ///
    /// When the decoded power exceeds ten times `max(1, V×I)` it is treated as
    /// a garbled register pair and replaced with the computed product.
    ///
    /// # Examples
    ///
    /// ```
    /// use fieldgate_types::MeterReading;
    ///
    /// let r = MeterReading::from_registers(&[1234, 250, 1500, 0, 12345, 0, 0, 0]).unwrap();
    /// assert_eq!(r.voltage, 12.34);
    /// assert_eq!(r.power, 150.0);
    /// ```
    pub fn from_registers(words: &[u16]) -> Result<Self, ParseError> {
        if words.len() < METER_REGISTER_COUNT {
            return Err(ParseError::InsufficientWords {
                expected: METER_REGISTER_COUNT,
                actual: words.len(),
            });
        }

        let voltage = f64::from(words[0]) * 0.01;
        let current = f64::from(words[1]) * 0.01;
        let power_raw = (u32::from(words[3]) << 16) | u32::from(words[2]);
        let mut power = f64::from(power_raw) * 0.1;
        let energy_raw = (u32::from(words[5]) << 16) | u32::from(words[4]);
        let energy = f64::from(energy_raw) / 1000.0;

        let computed = voltage * current;
        let mut power_substituted = false;
        if computed >= 0.0 && power > 10.0 * computed.max(1.0) {
            power = computed;
            power_substituted = true;
        }

        Ok(MeterReading {
            voltage: round_to(voltage, 2),
            current: round_to(current, 3),
            power: round_to(power, 2),
            energy: round_to(energy, 4),
            alarm_high: words[6] == ALARM_RAISED,
            alarm_low: words[7] == ALARM_RAISED,
            power_substituted,
        })
    }

    /// Decode a reading from the big-endian register payload of a response.
    pub fn from_bytes(data: &[u8]) -> Result<Self, ParseError> {
        use bytes::Buf;

        let available = data.len() / 2;
        if available < METER_REGISTER_COUNT {
            return Err(ParseError::InsufficientWords {
                expected: METER_REGISTER_COUNT,
                actual: available,
            });
        }

        let mut buf = data;
        let mut words = [0u16; METER_REGISTER_COUNT];
        for word in &mut words {
            *word = buf.get_u16();
        }
        Self::from_registers(&words)
    }
}

/// A decoded reading tied to its device and capture time.
#[derive(Debug, Clone, PartialEq)]
pub struct RawSample {
    pub device_id: String,
    pub reading: MeterReading,
    pub captured_at: OffsetDateTime,
}

impl RawSample {
    pub fn new(device_id: impl Into<String>, reading: MeterReading) -> Self {
        Self {
            device_id: device_id.into(),
            reading,
            captured_at: OffsetDateTime::now_utc(),
        }
    }
}

/// Summary of one aggregation window.
///
/// For every metric `min <= avg <= max`, and `sample_count` is at least 1.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AggregatedRecord {
    pub voltage_avg: f64,
    pub voltage_min: f64,
    pub voltage_max: f64,
    pub current_avg: f64,
    pub current_min: f64,
    pub current_max: f64,
    pub power_avg: f64,
    pub power_min: f64,
    pub power_max: f64,
    /// Last observed cumulative energy in the window.
    pub energy: f64,
    pub sample_count: u32,
    /// Window end time.
    #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339"))]
    pub timestamp: OffsetDateTime,
}

/// Round `value` to `decimals` places, half away from zero.
#[must_use]
pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}
