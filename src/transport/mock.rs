//! In-memory transport for tests and dry runs.
//!
//! Provides:
//! - scripted replies keyed on the prefix of written bytes
//! - an inbound buffer tests can feed directly
//! - controllable failure injection (open failure, timeouts, disconnection)
//! - call logging for test verification
//!
//! Clones share state, so a test keeps one handle while the session owns the
//! other.

use super::{Transport, READINESS_POLL_INTERVAL};
use crate::error::TransportError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fault {
    Timeout,
    Disconnect,
}

#[derive(Default)]
struct MockState {
    open: bool,
    fail_next_open: bool,
    write_fault: Option<Fault>,
    read_fault: Option<Fault>,
    inbound: Vec<u8>,
    replies: Vec<(Vec<u8>, Vec<u8>)>,
    written: Vec<Vec<u8>>,
    call_log: Vec<String>,
}

/// Mock transport with shared, inspectable state.
#[derive(Clone)]
pub struct MockTransport {
    endpoint: String,
    latency: Duration,
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            latency: Duration::ZERO,
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    /// Delay every write by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Whenever a write starts with `prefix`, append `reply` to the inbound buffer.
    pub fn respond_to(&self, prefix: impl AsRef<[u8]>, reply: impl AsRef<[u8]>) {
        self.state
            .lock()
            .replies
            .push((prefix.as_ref().to_vec(), reply.as_ref().to_vec()));
    }

    /// Append bytes to the inbound buffer as if the instrument had sent them.
    pub fn push_inbound(&self, data: impl AsRef<[u8]>) {
        self.state.lock().inbound.extend_from_slice(data.as_ref());
    }

    /// Make the next `open` fail.
    pub fn fail_next_open(&self) {
        self.state.lock().fail_next_open = true;
    }

    /// Make the next write time out.
    pub fn inject_write_timeout(&self) {
        self.state.lock().write_fault = Some(Fault::Timeout);
    }

    /// Make the next read time out even if data is buffered.
    pub fn inject_read_timeout(&self) {
        self.state.lock().read_fault = Some(Fault::Timeout);
    }

    /// Drop the connection on the next read, as a peer reset would.
    pub fn inject_disconnect(&self) {
        self.state.lock().read_fault = Some(Fault::Disconnect);
    }

    /// Every successful write, in order.
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.state.lock().written.clone()
    }

    /// Successful writes decoded as text with line terminators removed.
    pub fn written_text(&self) -> Vec<String> {
        self.state
            .lock()
            .written
            .iter()
            .map(|data| String::from_utf8_lossy(data).trim_end().to_string())
            .collect()
    }

    pub fn call_log(&self) -> Vec<String> {
        self.state.lock().call_log.clone()
    }

    pub fn clear_log(&self) {
        let mut state = self.state.lock();
        state.call_log.clear();
        state.written.clear();
    }

    fn fault_error(&self, fault: Fault, operation: &'static str, timeout: Duration) -> TransportError {
        match fault {
            Fault::Timeout => TransportError::Timeout {
                endpoint: self.endpoint.clone(),
                operation,
                timeout,
            },
            Fault::Disconnect => {
                self.state.lock().open = false;
                TransportError::Disconnected(self.endpoint.clone())
            }
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }

    fn is_open(&self) -> bool {
        self.state.lock().open
    }

    async fn open(&mut self) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.call_log.push("open".to_string());
        if std::mem::take(&mut state.fail_next_open) {
            return Err(TransportError::OpenFailed {
                endpoint: self.endpoint.clone(),
                reason: "Injected failure".to_string(),
            });
        }
        state.open = true;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.call_log.push("close".to_string());
        state.open = false;
        Ok(())
    }

    async fn write(&mut self, data: &[u8], timeout: Duration) -> Result<(), TransportError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let fault = {
            let mut state = self.state.lock();
            state
                .call_log
                .push(format!("write: {}", String::from_utf8_lossy(data).trim_end()));
            if !state.open {
                return Err(TransportError::NotOpen(self.endpoint.clone()));
            }
            state.write_fault.take()
        };
        if let Some(fault) = fault {
            return Err(self.fault_error(fault, "write", timeout));
        }

        let mut state = self.state.lock();
        state.written.push(data.to_vec());
        let reply = state
            .replies
            .iter()
            .find(|(prefix, _)| data.starts_with(prefix))
            .map(|(_, reply)| reply.clone());
        if let Some(reply) = reply {
            state.inbound.extend_from_slice(&reply);
        }
        Ok(())
    }

    async fn read_available(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let fault = {
            let mut state = self.state.lock();
            state.call_log.push("read".to_string());
            if !state.open {
                return Err(TransportError::NotOpen(self.endpoint.clone()));
            }
            state.read_fault.take()
        };
        if let Some(fault) = fault {
            return Err(self.fault_error(fault, "read", timeout));
        }

        let start = Instant::now();
        loop {
            {
                let mut state = self.state.lock();
                if !state.inbound.is_empty() {
                    return Ok(std::mem::take(&mut state.inbound));
                }
            }
            if start.elapsed() >= timeout {
                return Err(TransportError::Timeout {
                    endpoint: self.endpoint.clone(),
                    operation: "read",
                    timeout,
                });
            }
            tokio::time::sleep(READINESS_POLL_INTERVAL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_reply() {
        let mut mock = MockTransport::new("mock");
        mock.respond_to("*IDN?", "ACME,MODEL1\n");
        mock.open().await.unwrap();
        mock.write(b"*IDN?\r\n", Duration::from_millis(10)).await.unwrap();
        let reply = mock.read_available(Duration::from_millis(10)).await.unwrap();
        assert_eq!(reply, b"ACME,MODEL1\n".to_vec());
        assert_eq!(mock.written_text(), vec!["*IDN?"]);
    }

    #[tokio::test]
    async fn test_failure_injection_is_consumed() {
        let mut mock = MockTransport::new("mock");
        mock.fail_next_open();
        assert!(mock.open().await.is_err());
        assert!(mock.open().await.is_ok());

        mock.inject_write_timeout();
        assert!(mock.write(b"x", Duration::from_millis(5)).await.unwrap_err().is_timeout());
        assert!(mock.write(b"x", Duration::from_millis(5)).await.is_ok());
    }

    #[tokio::test]
    async fn test_disconnect_closes() {
        let mut mock = MockTransport::new("mock");
        mock.open().await.unwrap();
        mock.push_inbound(b"data");
        mock.inject_disconnect();
        let err = mock.read_available(Duration::from_millis(5)).await.unwrap_err();
        assert!(matches!(err, TransportError::Disconnected(_)));
        assert!(!mock.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_read_times_out() {
        let mut mock = MockTransport::new("mock");
        mock.open().await.unwrap();
        let err = mock.read_available(Duration::from_secs(1)).await.unwrap_err();
        assert!(err.is_timeout());
    }
}
