//! Core library for the gse_daq ground-test bench.
//!
//! This library contains the transports, wire protocols and instrument
//! sessions that drive satellite-bus and RF ground-test equipment, plus the
//! guarded long-running procedures built on top of them. It is used by the
//! `gse_daq` command-line binary and by any front-end that embeds a
//! [`workbench::Workbench`].

pub mod config;
pub mod error;
pub mod instrument;
pub mod logging;
pub mod procedure;
pub mod protocol;
pub mod remote;
pub mod transport;
pub mod workbench;
