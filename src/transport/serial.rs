//! RS-232 transport for the bus jig and the array simulator.
//!
//! Wraps the `serialport` crate. The port handle lives behind
//! `Arc<Mutex<Box<dyn SerialPort>>>` and every blocking call runs on Tokio's
//! blocking pool, so async callers never stall the runtime.
//!
//! Readiness is polled through the driver's byte counters: a write first waits
//! until `bytes_to_write() == 0`, a read first waits until `bytes_to_read() > 0`.
//! Both waits are bounded by the caller's timeout.

use super::Transport;
use crate::config::SerialConfig;
use crate::error::TransportError;
use async_trait::async_trait;
use std::time::Duration;

#[cfg(feature = "instrument_serial")]
use super::READINESS_POLL_INTERVAL;
#[cfg(feature = "instrument_serial")]
use crate::config::Parity;
#[cfg(feature = "instrument_serial")]
use serialport::SerialPort;
#[cfg(feature = "instrument_serial")]
use std::sync::Arc;
#[cfg(feature = "instrument_serial")]
use std::time::Instant;
#[cfg(feature = "instrument_serial")]
use tokio::sync::Mutex;
#[cfg(feature = "instrument_serial")]
use tracing::debug;

/// Serial port transport.
pub struct SerialTransport {
    config: SerialConfig,

    #[cfg(feature = "instrument_serial")]
    port: Option<Arc<Mutex<Box<dyn SerialPort>>>>,
}

impl SerialTransport {
    pub fn new(config: SerialConfig) -> Self {
        Self {
            config,
            #[cfg(feature = "instrument_serial")]
            port: None,
        }
    }

    /// Configured I/O timeout for this port.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.config.timeout_ms)
    }
}

#[cfg(feature = "instrument_serial")]
fn parity(parity: Parity) -> serialport::Parity {
    match parity {
        Parity::None => serialport::Parity::None,
        Parity::Even => serialport::Parity::Even,
        Parity::Odd => serialport::Parity::Odd,
    }
}

#[cfg(feature = "instrument_serial")]
fn data_bits(bits: u8) -> serialport::DataBits {
    match bits {
        5 => serialport::DataBits::Five,
        6 => serialport::DataBits::Six,
        7 => serialport::DataBits::Seven,
        _ => serialport::DataBits::Eight,
    }
}

#[cfg(feature = "instrument_serial")]
fn stop_bits(bits: u8) -> serialport::StopBits {
    if bits == 2 {
        serialport::StopBits::Two
    } else {
        serialport::StopBits::One
    }
}

#[cfg(feature = "instrument_serial")]
fn driver_error(endpoint: &str, err: serialport::Error) -> TransportError {
    match err.kind() {
        serialport::ErrorKind::NoDevice => TransportError::Disconnected(endpoint.to_string()),
        serialport::ErrorKind::Io(kind) => TransportError::Io(std::io::Error::new(kind, err.description)),
        _ => TransportError::OpenFailed {
            endpoint: endpoint.to_string(),
            reason: err.description,
        },
    }
}

#[cfg(feature = "instrument_serial")]
fn io_error(endpoint: &str, operation: &'static str, timeout: Duration, err: std::io::Error) -> TransportError {
    if err.kind() == std::io::ErrorKind::TimedOut {
        TransportError::Timeout {
            endpoint: endpoint.to_string(),
            operation,
            timeout,
        }
    } else {
        TransportError::Io(err)
    }
}

#[async_trait]
impl Transport for SerialTransport {
    fn endpoint(&self) -> String {
        self.config.port.clone()
    }

    fn is_open(&self) -> bool {
        #[cfg(feature = "instrument_serial")]
        {
            self.port.is_some()
        }
        #[cfg(not(feature = "instrument_serial"))]
        {
            false
        }
    }

    async fn open(&mut self) -> Result<(), TransportError> {
        #[cfg(feature = "instrument_serial")]
        {
            let config = self.config.clone();
            let port = tokio::task::spawn_blocking(move || {
                serialport::new(&config.port, config.baud_rate)
                    .parity(parity(config.parity))
                    .data_bits(data_bits(config.data_bits))
                    .stop_bits(stop_bits(config.stop_bits))
                    .timeout(Duration::from_millis(config.write_timeout_ms))
                    .open()
                    .map_err(|err| TransportError::OpenFailed {
                        endpoint: config.port.clone(),
                        reason: err.to_string(),
                    })
            })
            .await
            .map_err(|err| TransportError::Worker(err.to_string()))??;

            self.port = Some(Arc::new(Mutex::new(port)));
            debug!(
                "Serial port '{}' opened at {} baud ({:?}, {} data bits, {} stop bits)",
                self.config.port,
                self.config.baud_rate,
                self.config.parity,
                self.config.data_bits,
                self.config.stop_bits
            );
            Ok(())
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            Err(TransportError::FeatureNotEnabled("instrument_serial".to_string()))
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        #[cfg(feature = "instrument_serial")]
        {
            if self.port.take().is_some() {
                debug!("Serial port '{}' closed", self.config.port);
            }
        }
        Ok(())
    }

    async fn write(&mut self, data: &[u8], timeout: Duration) -> Result<(), TransportError> {
        #[cfg(feature = "instrument_serial")]
        {
            let port = self
                .port
                .as_ref()
                .ok_or_else(|| TransportError::NotOpen(self.config.port.clone()))?
                .clone();
            let endpoint = self.config.port.clone();
            let data = data.to_vec();

            tokio::task::spawn_blocking(move || {
                use std::io::Write;

                let mut port = port.blocking_lock();
                let start = Instant::now();
                loop {
                    let pending = port
                        .bytes_to_write()
                        .map_err(|err| driver_error(&endpoint, err))?;
                    if pending == 0 {
                        break;
                    }
                    if start.elapsed() >= timeout {
                        return Err(TransportError::Timeout {
                            endpoint,
                            operation: "drain the outbound buffer",
                            timeout,
                        });
                    }
                    std::thread::sleep(READINESS_POLL_INTERVAL);
                }

                port.write_all(&data)
                    .map_err(|err| io_error(&endpoint, "write", timeout, err))?;
                port.flush()
                    .map_err(|err| io_error(&endpoint, "flush", timeout, err))?;
                debug!("Serial TX '{}': {} byte(s)", endpoint, data.len());
                Ok(())
            })
            .await
            .map_err(|err| TransportError::Worker(err.to_string()))?
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            let _ = (data, timeout);
            Err(TransportError::FeatureNotEnabled("instrument_serial".to_string()))
        }
    }

    async fn read_available(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        #[cfg(feature = "instrument_serial")]
        {
            let port = self
                .port
                .as_ref()
                .ok_or_else(|| TransportError::NotOpen(self.config.port.clone()))?
                .clone();
            let endpoint = self.config.port.clone();

            tokio::task::spawn_blocking(move || {
                use std::io::Read;

                let mut port = port.blocking_lock();
                let start = Instant::now();
                let available = loop {
                    let available = port
                        .bytes_to_read()
                        .map_err(|err| driver_error(&endpoint, err))?;
                    if available > 0 {
                        break available as usize;
                    }
                    if start.elapsed() >= timeout {
                        return Err(TransportError::Timeout {
                            endpoint,
                            operation: "read",
                            timeout,
                        });
                    }
                    std::thread::sleep(READINESS_POLL_INTERVAL);
                };

                let mut buffer = vec![0u8; available];
                port.read_exact(&mut buffer)
                    .map_err(|err| io_error(&endpoint, "read", timeout, err))?;
                debug!("Serial RX '{}': {} byte(s)", endpoint, buffer.len());
                Ok(buffer)
            })
            .await
            .map_err(|err| TransportError::Worker(err.to_string()))?
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            let _ = timeout;
            Err(TransportError::FeatureNotEnabled("instrument_serial".to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closed_until_opened() {
        let transport = SerialTransport::new(SerialConfig::default());
        assert!(!transport.is_open());
        assert_eq!(transport.endpoint(), SerialConfig::default().port);
    }

    #[cfg(feature = "instrument_serial")]
    #[test]
    fn test_line_settings_mapping() {
        assert_eq!(parity(Parity::Even), serialport::Parity::Even);
        assert_eq!(data_bits(7), serialport::DataBits::Seven);
        assert_eq!(stop_bits(2), serialport::StopBits::Two);
        assert_eq!(stop_bits(1), serialport::StopBits::One);
    }

    #[tokio::test]
    async fn test_write_requires_open_port() {
        let mut transport = SerialTransport::new(SerialConfig::default());
        let result = transport.write(b"ENA\r\n", Duration::from_millis(10)).await;
        assert!(result.is_err());
    }
}
