//! Keysight U2000-series USB/LAN power sensor.

use super::scpi_session::ScpiSession;
use super::{network_channel, Instrument};
use crate::config::ScpiInstrumentConfig;
use crate::error::{SessionError, TransportError};
use crate::protocol::scpi::identity_regex;
use crate::transport::TransportChannel;
use async_trait::async_trait;
use tracing::warn;

const NAME: &str = "Power sensor";

pub const IDENTITY_PATTERN: &str =
    r"Keysight Technologies,U([0-9]{4})X*(A|B),MY([0-9]+),A([0-9]*).([0-9]{2}).([0-9]{2})";

/// Parse a numeric SCPI reply such as `-1.234560E+01`.
pub fn parse_reading(reply: &str) -> Option<f64> {
    match reply.trim().parse::<f64>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Unparseable power reading '{}'", reply.trim());
            None
        }
    }
}

pub struct PowerSensor {
    session: ScpiSession,
}

impl PowerSensor {
    pub fn new(channel: TransportChannel) -> Result<Self, regex::Error> {
        let session = ScpiSession::new(NAME, channel, identity_regex(IDENTITY_PATTERN)?)
            .with_terminators("\r\n", "\n");
        Ok(Self { session })
    }

    pub fn from_config(config: &ScpiInstrumentConfig) -> Result<Self, TransportError> {
        let channel = network_channel(&config.resource, config.timeout())?;
        Self::new(channel).map_err(|err| TransportError::UnsupportedResource(err.to_string()))
    }

    /// Trigger a measurement and fetch it, in dBm.
    ///
    /// `None` when the sensor did not answer or the reply was not a number.
    pub async fn get_reading(&mut self) -> Result<Option<f64>, SessionError> {
        // fetc? returns stale data unless init precedes it
        if !self.session.write("init").await? {
            return Ok(None);
        }
        let reply = self.session.query("fetc?").await?;
        Ok(reply.as_deref().and_then(parse_reading))
    }
}

#[async_trait]
impl Instrument for PowerSensor {
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
        self.session.close().await;
    }
}
