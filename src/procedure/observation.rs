//! Observation capture: warm-up, timed power samples, optional spectrum trace.

use super::Interrupted;
use crate::config::ObservationConfig;
use crate::instrument::{FreqResponse, PowerSensor, SpectrumAnalyzer};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const WARMUP_POLL: Duration = Duration::from_secs(1);

/// How a single observation run is paced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObservationPlan {
    pub warmup: Duration,
    pub samples: u32,
    pub sample_interval: Duration,
    pub capture_trace: bool,
}

impl From<&ObservationConfig> for ObservationPlan {
    fn from(config: &ObservationConfig) -> Self {
        Self {
            warmup: Duration::from_secs(config.warmup_s),
            samples: config.samples,
            sample_interval: Duration::from_millis(config.sample_interval_ms),
            capture_trace: config.capture_trace,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PowerSample {
    pub time: DateTime<Utc>,
    /// dBm; `None` when the sensor gave no usable reply
    pub power: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ObservationResult {
    pub samples: Vec<PowerSample>,
    pub spectrum: Option<FreqResponse>,
}

/// Run one observation until done or until `token` is cancelled.
///
/// Cancellation is not an error: the samples gathered so far are returned.
/// A failed reading or trace ends the run with those samples attached.
pub async fn run_observation(
    sensor: Arc<Mutex<PowerSensor>>,
    analyzer: Option<Arc<Mutex<SpectrumAnalyzer>>>,
    plan: ObservationPlan,
    token: CancellationToken,
) -> Result<ObservationResult, Interrupted<ObservationResult>> {
    let mut result = ObservationResult::default();

    if !warm_up(plan.warmup, &token).await {
        return Ok(result);
    }

    let mut ticker = interval(plan.sample_interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    for index in 0..plan.samples {
        tokio::select! {
            _ = token.cancelled() => {
                info!("Observation cancelled after {} sample(s)", index);
                return Ok(result);
            }
            _ = ticker.tick() => {}
        }
        let reading = sensor.lock().await.get_reading().await;
        let power = match reading {
            Ok(power) => power,
            Err(err) => {
                warn!("Observation stopped after {} sample(s): {}", index, err);
                return Err(Interrupted::new(err, result));
            }
        };
        debug!("Observation sample {}: {:?} dBm", index, power);
        result.samples.push(PowerSample {
            time: Utc::now(),
            power,
        });
    }

    if plan.capture_trace && !token.is_cancelled() {
        if let Some(analyzer) = analyzer {
            let trace = analyzer.lock().await.get_data(1).await;
            match trace {
                Ok(spectrum) => result.spectrum = spectrum,
                Err(err) => return Err(Interrupted::new(err, result)),
            }
        }
    }
    Ok(result)
}

/// Wait out the warm-up one second at a time; `false` when cancelled.
async fn warm_up(warmup: Duration, token: &CancellationToken) -> bool {
    let mut remaining = warmup;
    while !remaining.is_zero() {
        let step = remaining.min(WARMUP_POLL);
        tokio::select! {
            _ = token.cancelled() => {
                info!("Observation cancelled during warm-up");
                return false;
            }
            _ = tokio::time::sleep(step) => {}
        }
        remaining -= step;
    }
    !token.is_cancelled()
}
