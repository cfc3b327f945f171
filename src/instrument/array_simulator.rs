//! Solar-array simulator (SAS) session.
//!
//! Commands and telemetry use the binary frames in
//! [`crate::protocol::sas_frame`]. The session remembers the last accepted
//! output setting and on/off state; a setting outside the safe bounds raises
//! the range-error flag and leaves both untouched without transmitting.
//!
//! Repeat mode emulates an orbit: output is on with the requested setting
//! while `(elapsed + offset) % orbit_period < orbit_period * sun_rate`, off
//! otherwise, re-evaluated every `interval` seconds on a fixed-rate ticker.

use super::Instrument;
use crate::config::SerialConfig;
use crate::error::SessionError;
use crate::protocol::sas_frame::{decode_telemetry, encode_command, OutputSetting, OutputState};
use crate::transport::{SerialTransport, TransportChannel};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const NAME: &str = "Array simulator";

/// Orbit emulation parameters, all durations in whole seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RepeatSetting {
    /// Orbit period
    #[serde(default = "default_orbit_period")]
    pub orbit_period: u64,
    /// Fraction of the orbit spent in sunlight (0-1)
    #[serde(default = "default_sun_rate")]
    pub sun_rate: f64,
    /// Phase offset added to the elapsed time
    #[serde(default)]
    pub offset: u64,
    /// Re-evaluation period
    #[serde(default = "default_interval")]
    pub interval: u64,
}

fn default_orbit_period() -> u64 {
    90 * 60
}

fn default_sun_rate() -> f64 {
    0.6
}

fn default_interval() -> u64 {
    1
}

impl Default for RepeatSetting {
    fn default() -> Self {
        Self {
            orbit_period: default_orbit_period(),
            sun_rate: default_sun_rate(),
            offset: 0,
            interval: default_interval(),
        }
    }
}

impl RepeatSetting {
    pub fn validate(&self) -> Result<(), String> {
        if self.orbit_period == 0 {
            return Err("orbit_period must be > 0".to_string());
        }
        if !(0.0..=1.0).contains(&self.sun_rate) {
            return Err(format!("sun_rate {} must be within 0-1", self.sun_rate));
        }
        if self.interval == 0 {
            return Err("interval must be > 0".to_string());
        }
        Ok(())
    }

    /// Whether the output should be on `elapsed_s` seconds into the run.
    pub fn is_sun_phase(&self, elapsed_s: u64) -> bool {
        if self.orbit_period == 0 {
            return false;
        }
        // widened so any offset is accepted without overflow
        let phase = (u128::from(elapsed_s) + u128::from(self.offset)) % u128::from(self.orbit_period);
        (phase as f64) < self.orbit_period as f64 * self.sun_rate
    }
}

/// Latest telemetry snapshot; fields are `None` when no valid frame arrived.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SasData {
    /// Unix timestamp of the poll, in seconds
    pub time: i64,
    pub voltage: Option<f64>,
    pub current: Option<f64>,
}

impl SasData {
    fn empty() -> Self {
        Self {
            time: chrono::Utc::now().timestamp(),
            voltage: None,
            current: None,
        }
    }
}

/// Full session status returned by every simulator operation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SasStatus {
    pub is_open: bool,
    pub is_connection_error: bool,
    pub output_setting: OutputSetting,
    pub data: SasData,
    pub is_on: bool,
    pub repeat_on: bool,
    pub is_range_error: bool,
}

/// Array simulator shared between request handlers and the repeat worker.
pub type SharedArraySimulator = Arc<Mutex<ArraySimulator>>;

pub struct ArraySimulator {
    channel: TransportChannel,
    output_on: bool,
    setting: OutputSetting,
    range_error: bool,
    data: SasData,
    repeat: Option<CancellationToken>,
}

impl ArraySimulator {
    pub fn new(channel: TransportChannel) -> Self {
        Self {
            channel,
            output_on: false,
            setting: OutputSetting::default(),
            range_error: false,
            data: SasData::empty(),
            repeat: None,
        }
    }

    pub fn from_config(config: &SerialConfig) -> Self {
        let transport = SerialTransport::new(config.clone());
        Self::new(TransportChannel::new(Box::new(transport), config.timeout()))
    }

    pub fn shared(self) -> SharedArraySimulator {
        Arc::new(Mutex::new(self))
    }

    pub fn output_setting(&self) -> OutputSetting {
        self.setting
    }

    pub fn is_on(&self) -> bool {
        self.output_on
    }

    pub fn is_repeating(&self) -> bool {
        self.repeat
            .as_ref()
            .is_some_and(|token| !token.is_cancelled())
    }

    pub fn status(&self) -> SasStatus {
        SasStatus {
            is_open: self.channel.is_open(),
            is_connection_error: self.channel.has_error(),
            output_setting: self.setting,
            data: self.data,
            is_on: self.output_on,
            repeat_on: self.is_repeating(),
            is_range_error: self.range_error,
        }
    }

    /// Switch the output, optionally with a new setting.
    ///
    /// `None` means the default setting. Turning off always reverts to the
    /// default. Only a closed port is an error; a rejected setting is
    /// reported through `is_range_error`.
    pub async fn set_output(
        &mut self,
        state: OutputState,
        setting: Option<OutputSetting>,
    ) -> Result<SasStatus, SessionError> {
        if !self.channel.is_open() {
            return Err(SessionError::NotOpen(NAME));
        }

        let requested = setting.unwrap_or_default();
        let frame = match encode_command(state, &requested) {
            Ok(frame) => frame,
            Err(err) => {
                warn!("{}: setting rejected, output unchanged: {}", NAME, err);
                self.range_error = true;
                return Ok(self.status());
            }
        };

        self.range_error = false;
        self.output_on = state == OutputState::On;
        self.setting = match state {
            OutputState::On => requested,
            OutputState::Off => OutputSetting::default(),
        };
        debug!("{}: output {:?} with {:?}", NAME, state, self.setting);
        self.channel.send(&frame).await;
        Ok(self.status())
    }

    /// Read whatever telemetry is buffered and store the freshest valid reading.
    pub async fn poll_telemetry(&mut self) -> SasStatus {
        let mut data = SasData::empty();
        if self.channel.is_open() {
            if let Some(reading) = self
                .channel
                .receive_raw()
                .await
                .and_then(|raw| decode_telemetry(&raw))
            {
                data.voltage = Some(reading.voltage);
                data.current = Some(reading.current);
            }
        }
        self.data = data;
        self.status()
    }

    /// Start (or restart) repeat mode on a shared simulator.
    pub async fn start_repeating(
        simulator: &SharedArraySimulator,
        output: OutputSetting,
        repeat: RepeatSetting,
    ) -> Result<SasStatus, SessionError> {
        repeat.validate().map_err(SessionError::InvalidArgument)?;

        let token = CancellationToken::new();
        {
            let mut sas = simulator.lock().await;
            if !sas.channel.is_open() {
                return Err(SessionError::NotOpen(NAME));
            }
            if let Err(err) = output.validate() {
                warn!("{}: repeat not started: {}", NAME, err);
                sas.range_error = true;
                return Ok(sas.status());
            }
            if let Some(previous) = sas.repeat.replace(token.clone()) {
                previous.cancel();
            }
        }

        info!(
            "{}: repeat on (period {}s, sun rate {}, offset {}s, every {}s)",
            NAME, repeat.orbit_period, repeat.sun_rate, repeat.offset, repeat.interval
        );
        tokio::spawn(repeat_loop(Arc::clone(simulator), token, output, repeat));

        let status = simulator.lock().await.status();
        Ok(status)
    }

    /// Leave repeat mode and force the output off.
    pub async fn stop_repeating(&mut self) -> Result<SasStatus, SessionError> {
        if let Some(token) = self.repeat.take() {
            token.cancel();
            info!("{}: repeat off", NAME);
        }
        self.set_output(OutputState::Off, None).await
    }
}

async fn repeat_loop(
    simulator: SharedArraySimulator,
    token: CancellationToken,
    output: OutputSetting,
    repeat: RepeatSetting,
) {
    let start = Instant::now();
    let mut ticker = tokio::time::interval_at(start, Duration::from_secs(repeat.interval));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        let tick = tokio::select! {
            _ = token.cancelled() => break,
            tick = ticker.tick() => tick,
        };
        let elapsed = tick.duration_since(start).as_secs();
        let state = OutputState::from(repeat.is_sun_phase(elapsed));

        let mut sas = simulator.lock().await;
        if token.is_cancelled() {
            break;
        }
        if let Err(err) = sas.set_output(state, Some(output)).await {
            warn!("{}: repeat stopped: {}", NAME, err);
            token.cancel();
            break;
        }
    }
    debug!("{}: repeat worker exited", NAME);
}

#[async_trait]
impl Instrument for ArraySimulator {
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
        if let Some(token) = self.repeat.take() {
            token.cancel();
        }
        self.channel.close().await;
    }
}
