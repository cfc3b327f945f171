//! Byte-oriented transports and the shared channel lifecycle.
//!
//! A [`Transport`] is a leaf connection (serial port, raw SCPI socket, VISA
//! session) exposing open/close and raw send/receive. Every instrument session
//! embeds one [`TransportChannel`], which layers the common contract on top:
//!
//! - `open` is idempotent, `close` on a closed channel is a no-op
//! - `send`/`receive_raw` never raise; a timeout or disconnection is logged and
//!   recorded in a sticky error flag that the next successful I/O clears
//! - waits are bounded by the channel's configured timeout

use crate::error::TransportError;
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub mod mock;
pub mod serial;
pub mod socket;
pub mod visa;

pub use mock::MockTransport;
pub use serial::SerialTransport;
pub use socket::SocketTransport;
pub use visa::VisaTransport;

/// Poll period used by transports whose vendor API only offers readiness
/// counters (pending outbound/inbound bytes).
pub const READINESS_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Leaf connection to an instrument.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Port name, `host:port` or VISA resource string.
    fn endpoint(&self) -> String;

    /// Whether an underlying connection is currently held.
    fn is_open(&self) -> bool;

    /// Open the underlying connection.
    async fn open(&mut self) -> Result<(), TransportError>;

    /// Release the underlying connection.
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Wait (bounded by `timeout`) until no outbound backlog remains, then
    /// write all of `data`.
    async fn write(&mut self, data: &[u8], timeout: Duration) -> Result<(), TransportError>;

    /// Wait (bounded by `timeout`) until inbound data is available, then drain
    /// exactly what is currently buffered.
    async fn read_available(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError>;
}

/// A transport plus the open/error bookkeeping shared by every instrument.
pub struct TransportChannel {
    transport: Box<dyn Transport>,
    timeout: Duration,
    last_error: bool,
}

impl TransportChannel {
    /// Wrap a transport with the given I/O timeout.
    pub fn new(transport: Box<dyn Transport>, timeout: Duration) -> Self {
        Self {
            transport,
            timeout,
            last_error: false,
        }
    }

    /// Endpoint description of the wrapped transport.
    pub fn endpoint(&self) -> String {
        self.transport.endpoint()
    }

    /// I/O timeout applied to every send and receive.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_open()
    }

    /// Sticky flag set by the last failed send/receive.
    pub fn has_error(&self) -> bool {
        self.last_error
    }

    /// Open the transport unless it is already open.
    pub async fn open(&mut self) -> Result<(), TransportError> {
        if self.transport.is_open() {
            debug!("'{}' already open", self.transport.endpoint());
            return Ok(());
        }
        self.transport.open().await?;
        self.last_error = false;
        info!("Opened '{}'", self.transport.endpoint());
        Ok(())
    }

    /// Close the transport; closing a closed channel does nothing.
    pub async fn close(&mut self) {
        if !self.transport.is_open() {
            return;
        }
        match self.transport.close().await {
            Ok(()) => info!("Closed '{}'", self.transport.endpoint()),
            Err(err) => warn!("Error closing '{}': {}", self.transport.endpoint(), err),
        }
    }

    /// Send bytes, absorbing transport failures into the error flag.
    ///
    /// Returns whether the bytes were written.
    pub async fn send(&mut self, data: &[u8]) -> bool {
        match self.try_send(data).await {
            Ok(()) => true,
            Err(TransportError::NotOpen(endpoint)) => {
                warn!("Dropped {} byte(s): '{}' is not open", data.len(), endpoint);
                false
            }
            Err(err) => {
                error!("Send failed: {}", err);
                false
            }
        }
    }

    /// Receive whatever is buffered, or `None` on timeout/disconnection.
    pub async fn receive_raw(&mut self) -> Option<Vec<u8>> {
        let timeout = self.timeout;
        match self.try_receive(timeout).await {
            Ok(data) => Some(data),
            Err(TransportError::NotOpen(endpoint)) => {
                warn!("Cannot receive: '{}' is not open", endpoint);
                None
            }
            Err(err) => {
                error!("Receive failed: {}", err);
                None
            }
        }
    }

    /// Send bytes, recording the outcome in the error flag.
    pub async fn try_send(&mut self, data: &[u8]) -> Result<(), TransportError> {
        if !self.transport.is_open() {
            return Err(TransportError::NotOpen(self.transport.endpoint()));
        }
        let result = self.transport.write(data, self.timeout).await;
        self.last_error = result.is_err();
        result
    }

    /// Discard whatever is already buffered without waiting or touching the
    /// error flag. Returns the number of bytes dropped.
    pub async fn discard_input(&mut self) -> usize {
        if !self.transport.is_open() {
            return 0;
        }
        match self.transport.read_available(Duration::ZERO).await {
            Ok(stale) => stale.len(),
            Err(_) => 0,
        }
    }

    /// Receive with an explicit bound, recording the outcome in the error flag.
    pub async fn try_receive(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        if !self.transport.is_open() {
            return Err(TransportError::NotOpen(self.transport.endpoint()));
        }
        let result = self.transport.read_available(timeout).await;
        self.last_error = result.is_err();
        result
    }
}

/// Network instrument address forms accepted in configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resource {
    /// Raw SCPI socket, e.g. `TCPIP0::192.168.1.5::8023::SOCKET` or `192.168.1.5:5025`.
    Socket { host: String, port: u16 },
    /// Any other VISA resource string, e.g. `TCPIP0::192.168.1.20::inst0::INSTR`.
    Visa(String),
}

/// Classify a configured instrument address.
pub fn parse_resource(resource: &str) -> Result<Resource, TransportError> {
    let trimmed = resource.trim();
    let parts: Vec<&str> = trimmed.split("::").collect();

    if parts.len() == 4
        && parts[0].to_ascii_uppercase().starts_with("TCPIP")
        && parts[3].eq_ignore_ascii_case("SOCKET")
    {
        let port = parts[2]
            .parse::<u16>()
            .map_err(|_| TransportError::UnsupportedResource(trimmed.to_string()))?;
        return Ok(Resource::Socket {
            host: parts[1].to_string(),
            port,
        });
    }

    if parts.len() > 1 {
        return Ok(Resource::Visa(trimmed.to_string()));
    }

    match trimmed.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => {
            let port = port
                .parse::<u16>()
                .map_err(|_| TransportError::UnsupportedResource(trimmed.to_string()))?;
            Ok(Resource::Socket {
                host: host.to_string(),
                port,
            })
        }
        _ => Err(TransportError::UnsupportedResource(trimmed.to_string())),
    }
}

/// Build the transport for a network instrument address.
pub fn network_transport(
    resource: &str,
    connect_timeout: Duration,
) -> Result<Box<dyn Transport>, TransportError> {
    match parse_resource(resource)? {
        Resource::Socket { host, port } => {
            Ok(Box::new(SocketTransport::new(host, port, connect_timeout)))
        }
        Resource::Visa(resource) => Ok(Box::new(VisaTransport::new(resource))),
    }
}
