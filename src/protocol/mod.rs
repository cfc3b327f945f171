//! Wire protocols spoken by the bench instruments.

pub mod sas_frame;
pub mod scpi;

pub use sas_frame::{
    decode_telemetry, encode_command, FrameError, OutputSetting, OutputState, RangeError,
    TelemetryReading,
};
