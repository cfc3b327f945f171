//! Solar array simulator (SAS) binary framing.
//!
//! The simulator speaks a fixed-layout binary protocol over RS-232. Every frame
//! ends with a 2-byte big-endian checksum equal to the low 16 bits of the sum of
//! all preceding bytes.
//!
//! ## Command frame (24 bytes)
//!
//! ```text
//! +-------------+-------+--------+----+------+-------+-------+-------------+-------+
//! | 10 02 00 18 | on/off| 00 01  | 00 | Pmax | Voc*10| FF*1e4| FF x 8      | sum   |
//! +-------------+-------+--------+----+------+-------+-------+-------------+-------+
//!   header        1 B     array    IV   u16    u16     u16     reserved      u16
//! ```
//!
//! ## Telemetry frame (32 bytes)
//!
//! ```text
//! +-------------+-----+---------+---------+-----------------+-------+
//! | 10 12 00 20 | ... | V*10    | I*10    | ...             | sum   |
//! +-------------+-----+---------+---------+-----------------+-------+
//!                       bytes 6-7 bytes 8-9
//! ```
//!
//! The receive buffer is noisy: it can hold stale or partial frames ahead of the
//! freshest one, so decoding always uses the rightmost header.

use bytes::BufMut;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing::debug;

/// Header of every host-to-simulator command frame.
pub const COMMAND_HEADER: [u8; 4] = [0x10, 0x02, 0x00, 0x18];

/// Total command frame length, including checksum.
pub const COMMAND_LENGTH: usize = 24;

/// Header of every simulator-to-host telemetry frame.
pub const TELEMETRY_HEADER: [u8; 4] = [0x10, 0x12, 0x00, 0x20];

/// Total telemetry frame length, including checksum.
pub const TELEMETRY_LENGTH: usize = 32;

/// Array number addressed by every command.
const ARRAY_INDEX: [u8; 2] = [0x00, 0x01];

/// IV-curve channel addressed by every command.
const CHANNEL_INDEX: u8 = 0x00;

const RESERVED: [u8; 8] = [0xFF; 8];

/// Open-circuit voltage bounds in volts.
pub const VOC_MIN: f64 = 50.0;
pub const VOC_MAX: f64 = 100.0;

/// Short-circuit current bounds in amperes.
pub const ISC_MIN: f64 = 0.1;
pub const ISC_MAX: f64 = 4.0;

/// Fill factor bounds.
pub const FILL_FACTOR_MIN: f64 = 0.0;
pub const FILL_FACTOR_MAX: f64 = 1.0;

/// Byte offsets of one channel's readings inside a telemetry frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelLayout {
    pub name: &'static str,
    pub voltage_offset: usize,
    pub current_offset: usize,
}

/// Known channel layouts. Only CH1 is wired on the bench; further channels
/// extend this table once their offsets are documented.
pub const TELEMETRY_CHANNELS: &[ChannelLayout] = &[ChannelLayout {
    name: "CH1",
    voltage_offset: 6,
    current_offset: 8,
}];

/// Requested simulator output state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputState {
    On,
    Off,
}

impl OutputState {
    fn wire_byte(self) -> u8 {
        match self {
            OutputState::On => 0x01,
            OutputState::Off => 0x00,
        }
    }
}

impl From<bool> for OutputState {
    fn from(on: bool) -> Self {
        if on {
            OutputState::On
        } else {
            OutputState::Off
        }
    }
}

/// Simulated solar-array IV curve parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OutputSetting {
    /// Open-circuit voltage [V]
    pub voc: f64,
    /// Short-circuit current [A]
    pub isc: f64,
    /// Fill factor (0-1)
    pub fill_factor: f64,
}

impl Default for OutputSetting {
    fn default() -> Self {
        Self {
            voc: 50.0,
            isc: 0.1,
            fill_factor: 0.9,
        }
    }
}

impl OutputSetting {
    /// Maximum power point derived from the curve parameters [W].
    pub fn pmax(&self) -> f64 {
        self.voc * self.isc * self.fill_factor
    }

    /// Check every parameter against the simulator's safe bounds (inclusive).
    pub fn validate(&self) -> Result<(), RangeError> {
        check(SettingField::Voc, self.voc, VOC_MIN, VOC_MAX)?;
        check(SettingField::Isc, self.isc, ISC_MIN, ISC_MAX)?;
        check(
            SettingField::FillFactor,
            self.fill_factor,
            FILL_FACTOR_MIN,
            FILL_FACTOR_MAX,
        )
    }
}

fn check(field: SettingField, value: f64, min: f64, max: f64) -> Result<(), RangeError> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(RangeError {
            field,
            value,
            min,
            max,
        })
    }
}

/// Output setting parameter names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingField {
    Voc,
    Isc,
    FillFactor,
}

impl fmt::Display for SettingField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettingField::Voc => write!(f, "voc"),
            SettingField::Isc => write!(f, "isc"),
            SettingField::FillFactor => write!(f, "fill_factor"),
        }
    }
}

/// An output parameter outside the simulator's safe bounds.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{field} = {value} is outside [{min}, {max}]")]
pub struct RangeError {
    pub field: SettingField,
    pub value: f64,
    pub min: f64,
    pub max: f64,
}

/// Reasons a telemetry buffer yields no reading.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("telemetry header not found")]
    HeaderNotFound,

    #[error("telemetry frame truncated: {available} of {required} bytes available")]
    Truncated { available: usize, required: usize },

    #[error("telemetry checksum mismatch: computed {computed:#06X}, received {received:#06X}")]
    ChecksumMismatch { computed: u16, received: u16 },

    #[error("invalid hex input: {0}")]
    InvalidHex(String),
}

/// One decoded telemetry sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TelemetryReading {
    /// Array voltage [V]
    pub voltage: f64,
    /// Array current [A]
    pub current: f64,
}

/// Low 16 bits of the byte sum, most-significant byte first.
pub fn checksum(bytes: &[u8]) -> [u8; 2] {
    let sum = bytes.iter().fold(0u32, |acc, b| acc.wrapping_add(u32::from(*b)));
    ((sum & 0xFFFF) as u16).to_be_bytes()
}

/// Encode an on/off command frame.
///
/// Turning the output off always transmits the default setting, whatever the
/// caller supplied. A setting outside the safe bounds is rejected and must not
/// be transmitted.
pub fn encode_command(state: OutputState, setting: &OutputSetting) -> Result<Vec<u8>, RangeError> {
    let setting = match state {
        OutputState::On => *setting,
        OutputState::Off => OutputSetting::default(),
    };
    setting.validate()?;

    let mut frame = Vec::with_capacity(COMMAND_LENGTH);
    frame.extend_from_slice(&COMMAND_HEADER);
    frame.put_u8(state.wire_byte());
    frame.extend_from_slice(&ARRAY_INDEX);
    frame.put_u8(CHANNEL_INDEX);
    frame.put_u16(scaled(setting.pmax(), 1.0));
    frame.put_u16(scaled(setting.voc, 10.0));
    frame.put_u16(scaled(setting.fill_factor, 10_000.0));
    frame.extend_from_slice(&RESERVED);
    let sum = checksum(&frame);
    frame.extend_from_slice(&sum);

    debug_assert_eq!(frame.len(), COMMAND_LENGTH);
    Ok(frame)
}

// Values are validated before scaling, so the result always fits in u16.
fn scaled(value: f64, factor: f64) -> u16 {
    (value * factor).round() as u16
}

/// Extract and validate the freshest telemetry frame from a receive buffer.
pub fn parse_telemetry(buffer: &[u8]) -> Result<TelemetryReading, FrameError> {
    let start = buffer
        .windows(TELEMETRY_HEADER.len())
        .rposition(|window| window == TELEMETRY_HEADER)
        .ok_or(FrameError::HeaderNotFound)?;

    let available = buffer.len() - start;
    if available < TELEMETRY_LENGTH {
        return Err(FrameError::Truncated {
            available,
            required: TELEMETRY_LENGTH,
        });
    }

    let frame = &buffer[start..start + TELEMETRY_LENGTH];
    let (body, trailer) = frame.split_at(TELEMETRY_LENGTH - 2);
    let computed = u16::from_be_bytes(checksum(body));
    let received = u16::from_be_bytes([trailer[0], trailer[1]]);
    if computed != received {
        return Err(FrameError::ChecksumMismatch { computed, received });
    }

    let channel = &TELEMETRY_CHANNELS[0];
    Ok(TelemetryReading {
        voltage: read_scaled(frame, channel.voltage_offset),
        current: read_scaled(frame, channel.current_offset),
    })
}

fn read_scaled(frame: &[u8], offset: usize) -> f64 {
    f64::from(u16::from_be_bytes([frame[offset], frame[offset + 1]])) / 10.0
}

/// Decode a telemetry buffer, treating every protocol failure as "no reading yet".
pub fn decode_telemetry(buffer: &[u8]) -> Option<TelemetryReading> {
    match parse_telemetry(buffer) {
        Ok(reading) => Some(reading),
        Err(err) => {
            debug!("No SAS reading this poll: {}", err);
            None
        }
    }
}

/// Hex-string flavour of [`decode_telemetry`]; whitespace is ignored and hex
/// digits are case-insensitive.
pub fn decode_telemetry_hex(hex: &str) -> Option<TelemetryReading> {
    match hex_to_bytes(hex) {
        Ok(bytes) => decode_telemetry(&bytes),
        Err(err) => {
            debug!("No SAS reading this poll: {}", err);
            None
        }
    }
}

/// Parse `"10 12 00 20"` or `"10120020"` into bytes.
pub fn hex_to_bytes(hex: &str) -> Result<Vec<u8>, FrameError> {
    let digits: Vec<u8> = hex.bytes().filter(|b| !b.is_ascii_whitespace()).collect();
    if digits.len() % 2 != 0 {
        return Err(FrameError::InvalidHex(format!(
            "odd number of digits ({})",
            digits.len()
        )));
    }
    digits
        .chunks(2)
        .map(|pair| {
            let text = std::str::from_utf8(pair)
                .map_err(|_| FrameError::InvalidHex("non-ASCII input".to_string()))?;
            u8::from_str_radix(text, 16).map_err(|_| FrameError::InvalidHex(text.to_string()))
        })
        .collect()
}

/// Uppercase hex rendering used in wire logs.
pub fn bytes_to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02X}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setting(voc: f64, isc: f64, fill_factor: f64) -> OutputSetting {
        OutputSetting {
            voc,
            isc,
            fill_factor,
        }
    }

    fn telemetry_frame(voltage_raw: u16, current_raw: u16) -> Vec<u8> {
        let mut frame = TELEMETRY_HEADER.to_vec();
        frame.extend_from_slice(&[0x00, 0x01]);
        frame.extend_from_slice(&voltage_raw.to_be_bytes());
        frame.extend_from_slice(&current_raw.to_be_bytes());
        frame.resize(TELEMETRY_LENGTH - 2, 0x00);
        let sum = checksum(&frame);
        frame.extend_from_slice(&sum);
        frame
    }

    #[test]
    fn test_command_layout() {
        let frame = encode_command(OutputState::On, &setting(80.0, 4.0, 0.9)).unwrap();
        assert_eq!(frame.len(), COMMAND_LENGTH);
        assert_eq!(&frame[..4], &COMMAND_HEADER);
        assert_eq!(frame[4], 0x01);
        assert_eq!(&frame[5..8], &[0x00, 0x01, 0x00]);
        // Pmax 288 W, Voc 800 (x10), FF 9000 (x1e4)
        assert_eq!(&frame[8..14], &[0x01, 0x20, 0x03, 0x20, 0x23, 0x28]);
        assert_eq!(&frame[14..22], &[0xFF; 8]);
        assert_eq!(&frame[22..], &[0x08, 0xB3]);
    }

    #[test]
    fn test_checksum_round_trip() {
        let frame = encode_command(OutputState::On, &setting(72.5, 1.3, 0.75)).unwrap();
        let (body, trailer) = frame.split_at(COMMAND_LENGTH - 2);
        assert_eq!(checksum(body), [trailer[0], trailer[1]]);
    }

    #[test]
    fn test_single_byte_corruption_changes_checksum() {
        let frame = encode_command(OutputState::On, &setting(64.0, 2.0, 0.8)).unwrap();
        let body = &frame[..COMMAND_LENGTH - 2];
        let original = checksum(body);
        for index in 0..body.len() {
            let mut corrupted = body.to_vec();
            corrupted[index] = corrupted[index].wrapping_add(1);
            assert_ne!(checksum(&corrupted), original, "byte {} corrupted", index);
        }
    }

    #[test]
    fn test_checksum_wraps_at_16_bits() {
        let bytes = vec![0xFF; 300];
        // 300 * 255 = 76500 = 0x12AD4 -> 0x2AD4
        assert_eq!(checksum(&bytes), [0x2A, 0xD4]);
    }

    #[test]
    fn test_range_rejections() {
        assert_eq!(
            encode_command(OutputState::On, &setting(49.9, 1.0, 0.5))
                .unwrap_err()
                .field,
            SettingField::Voc
        );
        assert_eq!(
            encode_command(OutputState::On, &setting(60.0, 4.1, 0.5))
                .unwrap_err()
                .field,
            SettingField::Isc
        );
        assert_eq!(
            encode_command(OutputState::On, &setting(60.0, 1.0, 1.01))
                .unwrap_err()
                .field,
            SettingField::FillFactor
        );
        assert!(setting(f64::NAN, 1.0, 0.5).validate().is_err());
    }

    #[test]
    fn test_range_boundaries_inclusive() {
        assert!(encode_command(OutputState::On, &setting(50.0, 0.1, 0.0)).is_ok());
        assert!(encode_command(OutputState::On, &setting(100.0, 4.0, 1.0)).is_ok());
    }

    #[test]
    fn test_off_always_encodes_default() {
        let default = encode_command(OutputState::Off, &OutputSetting::default()).unwrap();
        let out_of_range = encode_command(OutputState::Off, &setting(500.0, 9.0, 3.0)).unwrap();
        assert_eq!(default, out_of_range);
        assert_eq!(default[4], 0x00);
        assert_eq!(&default[10..12], &500u16.to_be_bytes());
        assert_eq!(&default[12..14], &9000u16.to_be_bytes());
    }

    #[test]
    fn test_decode_valid_telemetry_hex() {
        let hex = bytes_to_hex(&telemetry_frame(823, 31));
        assert!(hex.starts_with("10120020"));
        assert_eq!(hex.len(), TELEMETRY_LENGTH * 2);

        let reading = decode_telemetry_hex(&format!("A5A5{}", hex.to_lowercase())).unwrap();
        assert!((reading.voltage - 82.3).abs() < 1e-9);
        assert!((reading.current - 3.1).abs() < 1e-9);
    }

    #[test]
    fn test_flipped_payload_digit_yields_no_reading() {
        let mut hex = bytes_to_hex(&telemetry_frame(823, 31)).into_bytes();
        // First hex digit of the voltage field
        hex[12] = if hex[12] == b'0' { b'1' } else { b'0' };
        let hex = String::from_utf8(hex).unwrap();
        assert!(decode_telemetry_hex(&hex).is_none());
        assert!(matches!(
            parse_telemetry(&hex_to_bytes(&hex).unwrap()),
            Err(FrameError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_rightmost_header_wins() {
        let mut buffer = telemetry_frame(500, 10);
        buffer.extend_from_slice(&telemetry_frame(700, 25));
        let reading = decode_telemetry(&buffer).unwrap();
        assert!((reading.voltage - 70.0).abs() < 1e-9);
        assert!((reading.current - 2.5).abs() < 1e-9);
    }

    #[test]
    fn test_truncated_freshest_frame_is_not_a_reading() {
        let mut buffer = telemetry_frame(500, 10);
        buffer.extend_from_slice(&telemetry_frame(700, 25)[..20]);
        assert_eq!(
            parse_telemetry(&buffer),
            Err(FrameError::Truncated {
                available: 20,
                required: TELEMETRY_LENGTH
            })
        );
    }

    #[test]
    fn test_missing_header() {
        assert_eq!(
            parse_telemetry(&[0x00, 0x11, 0x22]),
            Err(FrameError::HeaderNotFound)
        );
        assert!(decode_telemetry_hex("123").is_none());
    }
}
