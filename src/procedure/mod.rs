//! Long-running, single-flight test procedures.
//!
//! Each [`ProcedureKind`] owns one [`BusyGuard`]. Starting a procedure takes a
//! [`BusyTicket`] from the guard and moves it into a spawned worker; the guard
//! stays busy until that worker finishes and drops its ticket, even after a
//! cancel request. Workers poll their [`CancellationToken`] at every iteration
//! boundary and return whatever they collected so far. A worker that stops on
//! an error hands back its partial result inside [`Interrupted`], so the
//! published report carries both.

pub mod observation;
pub mod remote_processing;

pub use observation::{run_observation, ObservationPlan, ObservationResult, PowerSample};
pub use remote_processing::{run_remote_processing, ProcessingRequest, ProcessingResult};

use crate::error::{ErrorCategory, GseError, ProcedureError};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Guarded procedure categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcedureKind {
    Observation,
    RemoteProcessing,
}

impl fmt::Display for ProcedureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcedureKind::Observation => write!(f, "Observation"),
            ProcedureKind::RemoteProcessing => write!(f, "Remote processing"),
        }
    }
}

type ActiveToken = Arc<Mutex<Option<CancellationToken>>>;

/// Single-flight guard for one procedure category.
#[derive(Debug, Clone)]
pub struct BusyGuard {
    kind: ProcedureKind,
    active: ActiveToken,
}

impl BusyGuard {
    pub fn new(kind: ProcedureKind) -> Self {
        Self {
            kind,
            active: Arc::new(Mutex::new(None)),
        }
    }

    pub fn kind(&self) -> ProcedureKind {
        self.kind
    }

    pub fn is_busy(&self) -> bool {
        self.active.lock().is_some()
    }

    /// Claim the guard, or fail with `Busy` when a run is in flight.
    pub fn try_acquire(&self) -> Result<BusyTicket, ProcedureError> {
        let mut active = self.active.lock();
        if active.is_some() {
            return Err(ProcedureError::Busy(self.kind));
        }
        let token = CancellationToken::new();
        *active = Some(token.clone());
        Ok(BusyTicket {
            token,
            active: Arc::clone(&self.active),
        })
    }

    /// Ask the running worker to stop at its next poll point.
    pub fn cancel(&self) -> Result<(), ProcedureError> {
        match self.active.lock().as_ref() {
            Some(token) => {
                token.cancel();
                Ok(())
            }
            None => Err(ProcedureError::NotRunning(self.kind)),
        }
    }
}

/// Proof of a claimed guard; releases it when dropped.
#[derive(Debug)]
pub struct BusyTicket {
    token: CancellationToken,
    active: ActiveToken,
}

impl BusyTicket {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for BusyTicket {
    fn drop(&mut self) {
        *self.active.lock() = None;
    }
}

/// A run that stopped on an error, with whatever it gathered first.
#[derive(Debug)]
pub struct Interrupted<R> {
    pub error: GseError,
    pub partial: Option<R>,
}

impl<R> Interrupted<R> {
    pub fn new(error: impl Into<GseError>, partial: R) -> Self {
        Self {
            error: error.into(),
            partial: Some(partial),
        }
    }
}

impl<R> From<GseError> for Interrupted<R> {
    fn from(error: GseError) -> Self {
        Self {
            error,
            partial: None,
        }
    }
}

/// Everything a finished run leaves behind.
///
/// `error` holds caller-safe text only: unexpected failures are logged in
/// full and reported generically.
#[derive(Debug, Clone, Serialize)]
pub struct ProcedureReport<R> {
    pub run_id: Uuid,
    pub kind: ProcedureKind,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub cancelled: bool,
    pub result: Option<R>,
    pub error: Option<String>,
}

/// Shared "last result" slot written by the worker, read by pollers.
#[derive(Debug)]
pub struct ResultSlot<R> {
    inner: Arc<Mutex<Option<ProcedureReport<R>>>>,
}

impl<R> Clone for ResultSlot<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R> Default for ResultSlot<R> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(None)),
        }
    }
}

impl<R: Clone> ResultSlot<R> {
    pub fn publish(&self, report: ProcedureReport<R>) {
        *self.inner.lock() = Some(report);
    }

    pub fn latest(&self) -> Option<ProcedureReport<R>> {
        self.inner.lock().clone()
    }
}

/// A guarded procedure category together with its result slot.
pub struct Procedure<R> {
    guard: BusyGuard,
    slot: ResultSlot<R>,
}

impl<R> Procedure<R>
where
    R: Clone + Send + 'static,
{
    pub fn new(kind: ProcedureKind) -> Self {
        Self {
            guard: BusyGuard::new(kind),
            slot: ResultSlot::default(),
        }
    }

    pub fn kind(&self) -> ProcedureKind {
        self.guard.kind()
    }

    pub fn is_busy(&self) -> bool {
        self.guard.is_busy()
    }

    /// Spawn `work` and return its run id without waiting for it.
    ///
    /// The report is published before the guard is released, so a caller that
    /// sees the guard idle again always finds this run's report in the slot.
    pub fn start<F, Fut>(&self, work: F) -> Result<Uuid, ProcedureError>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<R, Interrupted<R>>> + Send + 'static,
    {
        let ticket = self.guard.try_acquire()?;
        let kind = self.guard.kind();
        let slot = self.slot.clone();
        let run_id = Uuid::new_v4();

        tokio::spawn(async move {
            let token = ticket.token().clone();
            let started_at = Utc::now();
            info!(%run_id, "{} procedure started", kind);

            let outcome = work(token.clone()).await;
            let cancelled = token.is_cancelled();
            let (result, error) = match outcome {
                Ok(result) => (Some(result), None),
                Err(Interrupted { error, partial }) => {
                    if error.category() == ErrorCategory::Unexpected {
                        error!(%run_id, "{} procedure failed: {:?}", kind, error);
                    } else {
                        warn!(%run_id, "{} procedure stopped: {}", kind, error);
                    }
                    (partial, Some(error.caller_message()))
                }
            };
            if cancelled {
                warn!(%run_id, "{} procedure cancelled", kind);
            } else {
                info!(%run_id, "{} procedure finished", kind);
            }

            slot.publish(ProcedureReport {
                run_id,
                kind,
                started_at,
                finished_at: Utc::now(),
                cancelled,
                result,
                error,
            });
            drop(ticket);
        });

        Ok(run_id)
    }

    pub fn cancel(&self) -> Result<(), ProcedureError> {
        self.guard.cancel()
    }

    pub fn last_report(&self) -> Option<ProcedureReport<R>> {
        self.slot.latest()
    }
}
