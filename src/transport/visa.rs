//! VISA transport for GPIB/USB/LXI instruments.
//!
//! Supports resource strings like:
//! - "GPIB0::1::INSTR"
//! - "USB0::0x2A8D::0x0101::MY12345678::INSTR"
//! - "TCPIP0::192.168.1.20::inst0::INSTR"
//!
//! Raw `::SOCKET` resources are handled by [`super::SocketTransport`] instead,
//! so the default build reaches LAN instruments without a vendor VISA library.

use super::Transport;
use crate::error::TransportError;
use async_trait::async_trait;
use std::time::Duration;

#[cfg(feature = "instrument_visa")]
use std::ffi::CString;
#[cfg(feature = "instrument_visa")]
use std::sync::Arc;
#[cfg(feature = "instrument_visa")]
use tokio::sync::Mutex;
#[cfg(feature = "instrument_visa")]
use tracing::debug;
#[cfg(feature = "instrument_visa")]
use visa_rs::prelude::*;

#[cfg(feature = "instrument_visa")]
const READ_CHUNK: usize = 64 * 1024;

/// An open VISA session. The resource manager must outlive the instrument.
#[cfg(feature = "instrument_visa")]
struct VisaSession {
    _rm: DefaultRM,
    instrument: Instrument,
}

/// VISA resource transport.
pub struct VisaTransport {
    resource: String,

    #[cfg(feature = "instrument_visa")]
    session: Option<Arc<Mutex<VisaSession>>>,
}

impl VisaTransport {
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            #[cfg(feature = "instrument_visa")]
            session: None,
        }
    }

    #[cfg(feature = "instrument_visa")]
    fn session(&self) -> Result<Arc<Mutex<VisaSession>>, TransportError> {
        self.session
            .clone()
            .ok_or_else(|| TransportError::NotOpen(self.resource.clone()))
    }
}

#[cfg(feature = "instrument_visa")]
fn visa_error(resource: &str, err: impl std::fmt::Display) -> TransportError {
    TransportError::OpenFailed {
        endpoint: resource.to_string(),
        reason: err.to_string(),
    }
}

#[async_trait]
impl Transport for VisaTransport {
    fn endpoint(&self) -> String {
        self.resource.clone()
    }

    fn is_open(&self) -> bool {
        #[cfg(feature = "instrument_visa")]
        {
            self.session.is_some()
        }
        #[cfg(not(feature = "instrument_visa"))]
        {
            false
        }
    }

    async fn open(&mut self) -> Result<(), TransportError> {
        #[cfg(feature = "instrument_visa")]
        {
            let resource = self.resource.clone();
            let session = tokio::task::spawn_blocking(move || {
                let rm = DefaultRM::new().map_err(|err| visa_error(&resource, err))?;
                let c_string = CString::new(resource.as_str())
                    .map_err(|err| visa_error(&resource, err))?;
                let visa_string = VisaString::from(c_string);
                let instrument = rm
                    .open(&visa_string, AccessMode::NO_LOCK, TIMEOUT_IMMEDIATE)
                    .map_err(|err| visa_error(&resource, err))?;
                Ok::<_, TransportError>(VisaSession { _rm: rm, instrument })
            })
            .await
            .map_err(|err| TransportError::Worker(err.to_string()))??;

            self.session = Some(Arc::new(Mutex::new(session)));
            debug!("VISA resource '{}' opened", self.resource);
            Ok(())
        }

        #[cfg(not(feature = "instrument_visa"))]
        {
            Err(TransportError::FeatureNotEnabled("instrument_visa".to_string()))
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        #[cfg(feature = "instrument_visa")]
        {
            if self.session.take().is_some() {
                debug!("VISA resource '{}' closed", self.resource);
            }
        }
        Ok(())
    }

    async fn write(&mut self, data: &[u8], timeout: Duration) -> Result<(), TransportError> {
        #[cfg(feature = "instrument_visa")]
        {
            let session = self.session()?;
            let resource = self.resource.clone();
            let data = data.to_vec();
            let task = tokio::task::spawn_blocking(move || {
                use std::io::Write;

                let mut session = session.blocking_lock();
                session.instrument.write_all(&data)?;
                session.instrument.flush()?;
                Ok::<_, TransportError>(data.len())
            });

            let written = tokio::time::timeout(timeout, task)
                .await
                .map_err(|_| TransportError::Timeout {
                    endpoint: resource.clone(),
                    operation: "write",
                    timeout,
                })?
                .map_err(|err| TransportError::Worker(err.to_string()))??;
            debug!("VISA TX '{}': {} byte(s)", resource, written);
            Ok(())
        }

        #[cfg(not(feature = "instrument_visa"))]
        {
            let _ = (data, timeout);
            Err(TransportError::FeatureNotEnabled("instrument_visa".to_string()))
        }
    }

    async fn read_available(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        #[cfg(feature = "instrument_visa")]
        {
            let session = self.session()?;
            let resource = self.resource.clone();
            let task = tokio::task::spawn_blocking(move || {
                use std::io::Read;

                let mut session = session.blocking_lock();
                let mut buffer = vec![0u8; READ_CHUNK];
                let n = session.instrument.read(&mut buffer)?;
                buffer.truncate(n);
                Ok::<_, TransportError>(buffer)
            });

            let buffer = tokio::time::timeout(timeout, task)
                .await
                .map_err(|_| TransportError::Timeout {
                    endpoint: resource.clone(),
                    operation: "read",
                    timeout,
                })?
                .map_err(|err| TransportError::Worker(err.to_string()))??;
            debug!("VISA RX '{}': {} byte(s)", resource, buffer.len());
            Ok(buffer)
        }

        #[cfg(not(feature = "instrument_visa"))]
        {
            let _ = timeout;
            Err(TransportError::FeatureNotEnabled("instrument_visa".to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_is_resource_string() {
        let transport = VisaTransport::new("GPIB0::7::INSTR");
        assert_eq!(transport.endpoint(), "GPIB0::7::INSTR");
        assert!(!transport.is_open());
    }

    #[cfg(not(feature = "instrument_visa"))]
    #[tokio::test]
    async fn test_open_without_feature_reports_it() {
        let mut transport = VisaTransport::new("GPIB0::7::INSTR");
        let err = transport.open().await.unwrap_err();
        assert!(matches!(err, TransportError::FeatureNotEnabled(_)));
    }
}
