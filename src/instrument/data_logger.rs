//! GRAPHTEC GL840 data logger.
//!
//! Bulk output queries have no length prefix, so every fetch is followed by
//! `*IDN?` and the reply is read until the identity line arrives. The returned
//! buffer therefore ends with that identity line; use [`strip_identity_tail`]
//! to recover the measurement bytes.

use super::scpi_session::{ScpiSession, IDENTITY_QUERY};
use super::{network_channel, Instrument};
use crate::config::DataLoggerConfig;
use crate::error::{SessionError, TransportError};
use crate::protocol::scpi::identity_regex;
use crate::transport::TransportChannel;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::info;

const NAME: &str = "Data logger";

pub const IDENTITY_PATTERN: &str = r"\*IDN GRAPHTEC,GL840,([0-9]+),([0-9]+).([0-9]+)";

const IDENTITY_MARKER: &[u8] = b"*IDN GRAPHTEC";
const TERMINATOR: &str = "\r\n";

macro_rules! scpi_keyword {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $text)] $variant),+
        }

        impl $name {
            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = SessionError;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                match value.trim().to_ascii_uppercase().as_str() {
                    $($text => Ok($name::$variant),)+
                    other => Err(SessionError::InvalidArgument(format!(
                        "unknown {} '{}'",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }
    };
}

scpi_keyword!(
    /// Channel input mode
    InputType {
        Off => "OFF",
        Dc => "DC",
        Temp => "TEMP",
    }
);

scpi_keyword!(
    /// DC voltage range
    VoltageRange {
        Mv20 => "20MV",
        Mv50 => "50MV",
        Mv100 => "100MV",
        Mv500 => "500MV",
        V1 => "1V",
        V2 => "2V",
        V5 => "5V",
        V10 => "10V",
        V20 => "20V",
        V50 => "50V",
        V100 => "100V",
    }
);

scpi_keyword!(
    /// Sampling interval
    SamplingInterval {
        Ms10 => "10MS",
        Ms20 => "20MS",
        Ms50 => "50MS",
        Ms100 => "100MS",
        Ms125 => "125MS",
        Ms250 => "250MS",
        Ms500 => "500MS",
        S1 => "1S",
        S2 => "2S",
        S5 => "5S",
        S10 => "10S",
        S20 => "20S",
        S30 => "30S",
        S60 => "60S",
        S120 => "120S",
        S300 => "300S",
        S600 => "600S",
        S1200 => "1200S",
        S1800 => "1800S",
        S3600 => "3600S",
    }
);

/// Normalise and check a channel name such as `ch3`.
pub fn validate_channel(channel: &str) -> Result<String, SessionError> {
    let channel = channel.trim().to_ascii_uppercase();
    let numbered = channel
        .strip_prefix("CH")
        .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()));
    if numbered {
        Ok(channel)
    } else {
        Err(SessionError::InvalidArgument(format!(
            "invalid channel '{}'; expected CH<n>",
            channel
        )))
    }
}

/// Split the measurement bytes from the trailing identity line.
///
/// Returns `None` until the identity line has fully arrived.
pub fn strip_identity_tail(raw: &[u8]) -> Option<&[u8]> {
    if !raw.ends_with(TERMINATOR.as_bytes()) {
        return None;
    }
    let position = raw
        .windows(IDENTITY_MARKER.len())
        .rposition(|window| window == IDENTITY_MARKER)?;
    Some(&raw[..position])
}

pub struct DataLogger {
    session: ScpiSession,
    recording: bool,
}

impl DataLogger {
    pub fn new(channel: TransportChannel) -> Result<Self, regex::Error> {
        let session = ScpiSession::new(NAME, channel, identity_regex(IDENTITY_PATTERN)?)
            .with_terminators(TERMINATOR, TERMINATOR);
        Ok(Self {
            session,
            recording: false,
        })
    }

    pub fn from_config(config: &DataLoggerConfig) -> Result<Self, TransportError> {
        let channel = network_channel(&config.resource, config.timeout())?;
        Self::new(channel).map_err(|err| TransportError::UnsupportedResource(err.to_string()))
    }

    pub fn is_recording(&self) -> bool {
        self.recording
    }

    /// Start recording to the logger's internal memory.
    pub async fn record_start(&mut self) -> Result<bool, SessionError> {
        if self.session.write(":MEAS:START").await? {
            self.recording = true;
            info!("{}: recording started", NAME);
        }
        Ok(self.recording)
    }

    pub async fn record_stop(&mut self) -> Result<bool, SessionError> {
        if self.session.write(":MEAS:STOP").await? {
            self.recording = false;
            info!("{}: recording stopped", NAME);
        }
        Ok(self.recording)
    }

    /// All buffered measurement data, followed by the identity line.
    pub async fn fetch_all_data(&mut self) -> Result<Option<Vec<u8>>, SessionError> {
        self.fetch(":MEAS:OUTP:ACK?").await
    }

    /// The newest measurement only, followed by the identity line.
    ///
    /// Pending bulk output is flushed first so the reply holds one record.
    pub async fn fetch_one_data(&mut self) -> Result<Option<Vec<u8>>, SessionError> {
        self.fetch(":MEAS:OUTP:ACK?").await?;
        self.fetch(":MEAS:OUTP:ONE?").await
    }

    async fn fetch(&mut self, command: &str) -> Result<Option<Vec<u8>>, SessionError> {
        if !self.session.write(command).await? || !self.session.write(IDENTITY_QUERY).await? {
            return Ok(None);
        }
        self.session
            .read_raw_until_complete(|buffer| strip_identity_tail(buffer).is_some())
            .await
    }

    pub async fn set_input(&mut self, channel: &str, input: InputType) -> Result<bool, SessionError> {
        let channel = validate_channel(channel)?;
        self.session
            .write(&format!(":AMP:{}:INP {}", channel, input))
            .await
    }

    pub async fn set_range(&mut self, channel: &str, range: VoltageRange) -> Result<bool, SessionError> {
        let channel = validate_channel(channel)?;
        self.session
            .write(&format!(":AMP:{}:RANG {}", channel, range))
            .await
    }

    pub async fn set_sampling(&mut self, sampling: SamplingInterval) -> Result<bool, SessionError> {
        self.session
            .write(&format!(":DATA:SAMP {}", sampling))
            .await
    }
}

#[async_trait]
impl Instrument for DataLogger {
    fn name(&self) -> &'static str {
        NAME
    }

    fn is_open(&self) -> bool {
        self.session.is_open()
    }

    async fn open(&mut self) -> Result<bool, SessionError> {
        self.session.open().await
    }

    async fn close(&mut self) {
        self.recording = false;
        self.session.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;
    use std::time::Duration;

    const IDN: &str = "*IDN GRAPHTEC,GL840,1,2.03\r\n";

    async fn open_logger(mock: &MockTransport) -> DataLogger {
        mock.respond_to("*IDN?", IDN);
        let channel = TransportChannel::new(Box::new(mock.clone()), Duration::from_millis(50));
        let mut logger = DataLogger::new(channel).unwrap();
        assert!(logger.open().await.unwrap());
        mock.clear_log();
        logger
    }

    #[test]
    fn test_validate_channel() {
        assert_eq!(validate_channel("ch12").unwrap(), "CH12");
        assert!(validate_channel("CH").is_err());
        assert!(validate_channel("XCH1").is_err());
    }

    #[test]
    fn test_keywords_parse_case_insensitively() {
        assert_eq!("temp".parse::<InputType>().unwrap(), InputType::Temp);
        assert_eq!("500mv".parse::<VoltageRange>().unwrap(), VoltageRange::Mv500);
        assert_eq!(SamplingInterval::S3600.as_str(), "3600S");
        assert!("3S".parse::<SamplingInterval>().is_err());
    }

    #[test]
    fn test_strip_identity_tail() {
        let raw = b"#6000004DATA*IDN GRAPHTEC,GL840,1,2.03\r\n";
        assert_eq!(strip_identity_tail(raw), Some(&b"#6000004DATA"[..]));
        assert_eq!(strip_identity_tail(b"#6000004DATA*IDN GRAPH"), None);
        assert_eq!(strip_identity_tail(b"DATA\r\n"), None);
    }

    #[tokio::test]
    async fn test_wrong_identity_does_not_open() {
        let mock = MockTransport::new("mock");
        mock.respond_to("*IDN?", "*IDN GRAPHTEC,GL240,1,2.03\r\n");
        let channel = TransportChannel::new(Box::new(mock.clone()), Duration::from_millis(50));
        let mut logger = DataLogger::new(channel).unwrap();
        assert!(!logger.open().await.unwrap());
        assert!(matches!(
            logger.record_start().await,
            Err(SessionError::NotOpen("Data logger"))
        ));
    }

    #[tokio::test]
    async fn test_record_start_stop() {
        let mock = MockTransport::new("mock");
        let mut logger = open_logger(&mock).await;
        assert!(logger.record_start().await.unwrap());
        assert!(!logger.record_stop().await.unwrap());
        assert_eq!(mock.written_text(), vec![":MEAS:START", ":MEAS:STOP"]);
    }

    #[tokio::test]
    async fn test_fetch_one_flushes_then_reads_record() {
        let mock = MockTransport::new("mock");
        let mut logger = open_logger(&mock).await;
        mock.respond_to(":MEAS:OUTP:ACK?", "OLD,OLD\r\n");
        mock.respond_to(":MEAS:OUTP:ONE?", "NEW\r\n");

        let raw = logger.fetch_one_data().await.unwrap().unwrap();
        assert_eq!(strip_identity_tail(&raw), Some(&b"NEW\r\n"[..]));
        assert_eq!(
            mock.written_text(),
            vec![":MEAS:OUTP:ACK?", "*IDN?", ":MEAS:OUTP:ONE?", "*IDN?"]
        );
    }

    #[tokio::test]
    async fn test_settings_commands() {
        let mock = MockTransport::new("mock");
        let mut logger = open_logger(&mock).await;
        logger.set_input("ch1", InputType::Dc).await.unwrap();
        logger.set_range("CH1", VoltageRange::V10).await.unwrap();
        logger.set_sampling(SamplingInterval::Ms500).await.unwrap();
        assert!(logger.set_input("A1", InputType::Dc).await.is_err());
        assert_eq!(
            mock.written_text(),
            vec![":AMP:CH1:INP DC", ":AMP:CH1:RANG 10V", ":DATA:SAMP 500MS"]
        );
    }
}
