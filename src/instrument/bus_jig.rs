//! Satellite bus power jig on RS-232.
//!
//! Two ASCII commands, CRLF-terminated: `ENA` powers the bus, `DIS` removes
//! power. The jig sends no acknowledgement, so the enabled flag tracks the last
//! command that was written successfully.

use super::Instrument;
use crate::config::SerialConfig;
use crate::error::SessionError;
use crate::transport::{SerialTransport, TransportChannel};
use async_trait::async_trait;
use serde::Serialize;
use tracing::info;

const NAME: &str = "Bus jig";
const TERMINATOR: &str = "\r\n";

/// Snapshot reported after every bus jig operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BusJigStatus {
    pub is_open: bool,
    pub is_connection_error: bool,
    pub is_enabled: bool,
}

pub struct BusJig {
    channel: TransportChannel,
    enabled: bool,
}

impl BusJig {
    pub fn new(channel: TransportChannel) -> Self {
        Self {
            channel,
            enabled: false,
        }
    }

    pub fn from_config(config: &SerialConfig) -> Self {
        let transport = SerialTransport::new(config.clone());
        Self::new(TransportChannel::new(Box::new(transport), config.timeout()))
    }

    pub fn status(&self) -> BusJigStatus {
        BusJigStatus {
            is_open: self.channel.is_open(),
            is_connection_error: self.channel.has_error(),
            is_enabled: self.enabled,
        }
    }

    /// Power the satellite bus.
    pub async fn enable(&mut self) -> Result<BusJigStatus, SessionError> {
        self.command("ENA", true).await
    }

    /// Remove bus power.
    pub async fn disable(&mut self) -> Result<BusJigStatus, SessionError> {
        self.command("DIS", false).await
    }

    async fn command(&mut self, command: &str, enabled: bool) -> Result<BusJigStatus, SessionError> {
        if !self.channel.is_open() {
            return Err(SessionError::NotOpen(NAME));
        }
        let line = format!("{}{}", command, TERMINATOR);
        if self.channel.send(line.as_bytes()).await {
            self.enabled = enabled;
            info!("Bus jig: {}", command);
        }
        Ok(self.status())
    }
}

#[async_trait]
impl Instrument for BusJig {
    fn name(&self) -> &'static str {
        NAME
    }

    fn is_open(&self) -> bool {
        self.channel.is_open()
    }

    async fn open(&mut self) -> Result<bool, SessionError> {
        self.channel.open().await?;
        Ok(self.channel.is_open())
    }

    async fn close(&mut self) {
        self.channel.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;
    use std::time::Duration;

    fn jig(mock: &MockTransport) -> BusJig {
        BusJig::new(TransportChannel::new(
            Box::new(mock.clone()),
            Duration::from_millis(20),
        ))
    }

    #[tokio::test]
    async fn test_enable_disable() {
        let mock = MockTransport::new("COM3");
        let mut jig = jig(&mock);
        assert!(jig.open().await.unwrap());

        assert!(jig.enable().await.unwrap().is_enabled);
        assert!(!jig.disable().await.unwrap().is_enabled);
        assert_eq!(mock.written(), vec![b"ENA\r\n".to_vec(), b"DIS\r\n".to_vec()]);
    }

    #[tokio::test]
    async fn test_requires_open_port() {
        let mock = MockTransport::new("COM3");
        let mut jig = jig(&mock);
        assert!(matches!(
            jig.enable().await,
            Err(SessionError::NotOpen("Bus jig"))
        ));
        assert!(mock.written().is_empty());
    }

    #[tokio::test]
    async fn test_failed_write_keeps_flag_and_reports_error() {
        let mock = MockTransport::new("COM3");
        let mut jig = jig(&mock);
        jig.open().await.unwrap();
        mock.inject_write_timeout();
        let status = jig.enable().await.unwrap();
        assert!(!status.is_enabled);
        assert!(status.is_connection_error);
    }
}
