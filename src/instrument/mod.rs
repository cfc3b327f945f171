//! Instrument sessions.
//!
//! Each session owns one [`TransportChannel`] and exposes only the operations
//! its instrument supports. Serial instruments (bus jig, array simulator) count
//! as open when their port is open; SCPI instruments additionally require a
//! matching `*IDN?` reply.

use crate::error::{SessionError, TransportError};
use crate::transport::{network_transport, TransportChannel};
use async_trait::async_trait;
use std::time::Duration;

pub mod array_simulator;
pub mod bus_jig;
pub mod data_logger;
pub mod power_sensor;
pub mod scpi_session;
pub mod spectrum_analyzer;

pub use array_simulator::{ArraySimulator, RepeatSetting, SasStatus, SharedArraySimulator};
pub use bus_jig::BusJig;
pub use data_logger::DataLogger;
pub use power_sensor::PowerSensor;
pub use scpi_session::ScpiSession;
pub use spectrum_analyzer::{FreqResponse, SpectrumAnalyzer};

/// Connection lifecycle shared by every instrument session.
#[async_trait]
pub trait Instrument: Send {
    /// Human-readable instrument name used in logs and errors.
    fn name(&self) -> &'static str;

    /// Pure state query.
    fn is_open(&self) -> bool;

    /// Open the session if needed. Idempotent.
    ///
    /// Returns whether the session is open afterwards. A transport that
    /// cannot be opened at all is an error.
    async fn open(&mut self) -> Result<bool, SessionError>;

    /// Close the session. Safe to call when already closed.
    async fn close(&mut self);
}

/// Channel for a network instrument resource string.
pub fn network_channel(resource: &str, timeout: Duration) -> Result<TransportChannel, TransportError> {
    let transport = network_transport(resource, timeout)?;
    Ok(TransportChannel::new(transport, timeout))
}
