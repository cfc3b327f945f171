//! Process-wide session registry and the caller-facing operation surface.
//!
//! A [`Workbench`] is built once at start-up and holds at most one session per
//! instrument plus the two guarded procedures. Every operation returns an
//! [`Outcome`]: a success flag with either a payload or a message. Errors
//! classified as unexpected are logged in full and reported only generically.

use crate::config::{ObservationConfig, Settings};
use crate::error::{AppResult, ErrorCategory, GseError};
pub use crate::error::UNEXPECTED_MESSAGE;
use crate::instrument::bus_jig::BusJigStatus;
use crate::instrument::data_logger::{strip_identity_tail, InputType, SamplingInterval, VoltageRange};
use crate::instrument::{
    ArraySimulator, BusJig, DataLogger, FreqResponse, Instrument, PowerSensor, RepeatSetting,
    SasStatus, SharedArraySimulator, SpectrumAnalyzer,
};
use crate::procedure::{
    run_observation, run_remote_processing, ObservationPlan, ObservationResult, Procedure,
    ProcedureKind, ProcedureReport, ProcessingRequest, ProcessingResult,
};
use crate::protocol::sas_frame::{OutputSetting, OutputState};
use crate::remote::{
    CommandOutput, LoggerFtpClient, ModemClient, RecorderClient, RemoteCredentials,
    RemoteSessionAdapter, SshConnector,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

const BUS_JIG: &str = "Bus jig";
const ARRAY_SIMULATOR: &str = "Array simulator";
const DATA_LOGGER: &str = "Data logger";
const LOGGER_FTP: &str = "Data logger FTP";
const POWER_SENSOR: &str = "Power sensor";
const SPECTRUM_ANALYZER: &str = "Spectrum analyzer";
const REMOTE_HOST: &str = "Recorder shell";
const RECORDER: &str = "Recorder";
const MODEM: &str = "Modem";

/// Structured result of one operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Outcome<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> Outcome<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }

    pub fn from_result(result: AppResult<T>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(err) => {
                if err.category() == ErrorCategory::Unexpected {
                    error!("Unexpected failure: {:?}", err);
                } else {
                    warn!("Operation failed: {}", err);
                }
                Self::failure(err.caller_message())
            }
        }
    }
}

type Slot<T> = Option<Arc<Mutex<T>>>;

fn slot<T>(session: Option<T>) -> Slot<T> {
    session.map(|session| Arc::new(Mutex::new(session)))
}

fn require<'a, T>(slot: &'a Slot<T>, name: &'static str) -> AppResult<&'a Arc<Mutex<T>>> {
    slot.as_ref().ok_or(GseError::InstrumentUnavailable(name))
}

fn require_data<T>(data: Option<T>, name: &'static str) -> AppResult<T> {
    data.ok_or(GseError::NoData(name))
}

async fn connect<T: Instrument>(slot: &Slot<T>, name: &'static str) -> AppResult<bool> {
    let mut session = require(slot, name)?.lock().await;
    Ok(session.open().await?)
}

async fn disconnect<T: Instrument>(slot: &Slot<T>, name: &'static str) -> AppResult<bool> {
    let mut session = require(slot, name)?.lock().await;
    session.close().await;
    Ok(session.is_open())
}

/// Remote shell access plus the processing script it runs.
#[derive(Debug, Clone)]
pub struct RemoteHost {
    pub adapter: RemoteSessionAdapter,
    pub script_dir: String,
    pub script: String,
}

/// Assembles a [`Workbench`] from individual sessions.
#[derive(Default)]
pub struct WorkbenchBuilder {
    bus_jig: Option<BusJig>,
    array_simulator: Option<ArraySimulator>,
    sas_output: OutputSetting,
    sas_repeat: RepeatSetting,
    data_logger: Option<DataLogger>,
    logger_ftp: Option<LoggerFtpClient>,
    power_sensor: Option<PowerSensor>,
    spectrum_analyzer: Option<SpectrumAnalyzer>,
    remote: Option<RemoteHost>,
    recorder: Option<RecorderClient>,
    modem: Option<ModemClient>,
    observation: ObservationConfig,
}

impl WorkbenchBuilder {
    pub fn bus_jig(mut self, jig: BusJig) -> Self {
        self.bus_jig = Some(jig);
        self
    }

    /// Array simulator with the output/repeat settings used when none are given.
    pub fn array_simulator(
        mut self,
        simulator: ArraySimulator,
        output: OutputSetting,
        repeat: RepeatSetting,
    ) -> Self {
        self.array_simulator = Some(simulator);
        self.sas_output = output;
        self.sas_repeat = repeat;
        self
    }

    pub fn data_logger(mut self, logger: DataLogger) -> Self {
        self.data_logger = Some(logger);
        self
    }

    pub fn logger_ftp(mut self, ftp: LoggerFtpClient) -> Self {
        self.logger_ftp = Some(ftp);
        self
    }

    pub fn power_sensor(mut self, sensor: PowerSensor) -> Self {
        self.power_sensor = Some(sensor);
        self
    }

    pub fn spectrum_analyzer(mut self, analyzer: SpectrumAnalyzer) -> Self {
        self.spectrum_analyzer = Some(analyzer);
        self
    }

    pub fn remote(mut self, remote: RemoteHost) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn recorder(mut self, recorder: RecorderClient) -> Self {
        self.recorder = Some(recorder);
        self
    }

    pub fn modem(mut self, modem: ModemClient) -> Self {
        self.modem = Some(modem);
        self
    }

    pub fn observation(mut self, observation: ObservationConfig) -> Self {
        self.observation = observation;
        self
    }

    pub fn build(self) -> Workbench {
        Workbench {
            bus_jig: slot(self.bus_jig),
            array_simulator: self.array_simulator.map(ArraySimulator::shared),
            sas_output: self.sas_output,
            sas_repeat: self.sas_repeat,
            data_logger: slot(self.data_logger),
            logger_ftp: self.logger_ftp,
            power_sensor: slot(self.power_sensor),
            spectrum_analyzer: slot(self.spectrum_analyzer),
            remote: self.remote,
            recorder: self.recorder,
            modem: self.modem,
            observation_plan: ObservationPlan::from(&self.observation),
            observation: Procedure::new(ProcedureKind::Observation),
            processing: Procedure::new(ProcedureKind::RemoteProcessing),
        }
    }
}

/// One session per configured instrument, plus the guarded procedures.
pub struct Workbench {
    bus_jig: Slot<BusJig>,
    array_simulator: Option<SharedArraySimulator>,
    sas_output: OutputSetting,
    sas_repeat: RepeatSetting,
    data_logger: Slot<DataLogger>,
    logger_ftp: Option<LoggerFtpClient>,
    power_sensor: Slot<PowerSensor>,
    spectrum_analyzer: Slot<SpectrumAnalyzer>,
    remote: Option<RemoteHost>,
    recorder: Option<RecorderClient>,
    modem: Option<ModemClient>,
    observation_plan: ObservationPlan,
    observation: Procedure<ObservationResult>,
    processing: Procedure<ProcessingResult>,
}

fn built<T, E: std::fmt::Display>(name: &str, result: Result<T, E>) -> Option<T> {
    match result {
        Ok(session) => Some(session),
        Err(err) => {
            warn!("{} not available: {}", name, err);
            None
        }
    }
}

impl Workbench {
    pub fn builder() -> WorkbenchBuilder {
        WorkbenchBuilder::default()
    }

    /// Build every configured session. `None` (an unreadable configuration)
    /// yields a workbench on which every instrument is unavailable.
    pub fn from_settings(settings: Option<&Settings>) -> Self {
        let Some(settings) = settings else {
            warn!("No usable configuration; all instruments unavailable");
            return Self::builder().build();
        };

        let mut builder = Self::builder().observation(settings.observation.clone());
        if let Some(config) = &settings.bus_jig {
            builder = builder.bus_jig(BusJig::from_config(&config.serial));
        }
        if let Some(config) = &settings.array_simulator {
            builder = builder.array_simulator(
                ArraySimulator::from_config(&config.serial),
                config.output,
                config.repeat,
            );
        }
        if let Some(config) = &settings.data_logger {
            if let Some(logger) = built(DATA_LOGGER, DataLogger::from_config(config)) {
                builder = builder.data_logger(logger);
            }
            if let Some(ftp) = &config.ftp {
                builder =
                    builder.logger_ftp(LoggerFtpClient::from_config(ftp, config.timeout()));
            }
        }
        if let Some(config) = &settings.power_sensor {
            if let Some(sensor) = built(POWER_SENSOR, PowerSensor::from_config(config)) {
                builder = builder.power_sensor(sensor);
            }
        }
        if let Some(config) = &settings.spectrum_analyzer {
            if let Some(analyzer) = built(SPECTRUM_ANALYZER, SpectrumAnalyzer::from_config(config)) {
                builder = builder.spectrum_analyzer(analyzer);
            }
        }
        if let Some(config) = &settings.recorder {
            if let Some(recorder) = built(RECORDER, RecorderClient::from_config(config)) {
                builder = builder.recorder(recorder);
            }
            if let Some(ssh) = &config.ssh {
                let adapter = RemoteSessionAdapter::new(
                    RemoteCredentials::from(ssh),
                    Arc::new(SshConnector::default()),
                );
                builder = builder.remote(RemoteHost {
                    adapter,
                    script_dir: ssh.script_dir.clone(),
                    script: ssh.script.clone(),
                });
            }
        }
        if let Some(config) = &settings.modem {
            if let Some(modem) = built(MODEM, ModemClient::from_config(config)) {
                builder = builder.modem(modem);
            }
        }
        builder.build()
    }

    /// Close every open session and cancel running procedures.
    pub async fn shutdown(&self) {
        let _ = self.observation.cancel();
        let _ = self.processing.cancel();
        if let Some(sas) = &self.array_simulator {
            sas.lock().await.close().await;
        }
        if let Some(jig) = &self.bus_jig {
            jig.lock().await.close().await;
        }
        if let Some(logger) = &self.data_logger {
            logger.lock().await.close().await;
        }
        if let Some(sensor) = &self.power_sensor {
            sensor.lock().await.close().await;
        }
        if let Some(analyzer) = &self.spectrum_analyzer {
            analyzer.lock().await.close().await;
        }
        info!("Workbench shut down");
    }

    // ------------------------------------------------------------------
    // Bus jig
    // ------------------------------------------------------------------

    pub async fn connect_bus_jig(&self) -> Outcome<bool> {
        Outcome::from_result(connect(&self.bus_jig, BUS_JIG).await)
    }

    pub async fn disconnect_bus_jig(&self) -> Outcome<bool> {
        Outcome::from_result(disconnect(&self.bus_jig, BUS_JIG).await)
    }

    pub async fn bus_jig_status(&self) -> Outcome<BusJigStatus> {
        Outcome::from_result(self.bus_jig_status_inner().await)
    }

    async fn bus_jig_status_inner(&self) -> AppResult<BusJigStatus> {
        Ok(require(&self.bus_jig, BUS_JIG)?.lock().await.status())
    }

    pub async fn bus_jig_enable(&self, enabled: bool) -> Outcome<BusJigStatus> {
        Outcome::from_result(self.bus_jig_enable_inner(enabled).await)
    }

    async fn bus_jig_enable_inner(&self, enabled: bool) -> AppResult<BusJigStatus> {
        let mut jig = require(&self.bus_jig, BUS_JIG)?.lock().await;
        let status = if enabled {
            jig.enable().await?
        } else {
            jig.disable().await?
        };
        Ok(status)
    }

    // ------------------------------------------------------------------
    // Array simulator
    // ------------------------------------------------------------------

    fn sas(&self) -> AppResult<&SharedArraySimulator> {
        self.array_simulator
            .as_ref()
            .ok_or(GseError::InstrumentUnavailable(ARRAY_SIMULATOR))
    }

    pub async fn connect_array_simulator(&self) -> Outcome<bool> {
        Outcome::from_result(connect(&self.array_simulator, ARRAY_SIMULATOR).await)
    }

    pub async fn disconnect_array_simulator(&self) -> Outcome<bool> {
        Outcome::from_result(disconnect(&self.array_simulator, ARRAY_SIMULATOR).await)
    }

    pub async fn sas_status(&self) -> Outcome<SasStatus> {
        Outcome::from_result(self.sas_status_inner().await)
    }

    async fn sas_status_inner(&self) -> AppResult<SasStatus> {
        Ok(self.sas()?.lock().await.status())
    }

    /// Switch the output. Without a setting the configured default is used.
    pub async fn sas_set_output(
        &self,
        state: OutputState,
        setting: Option<OutputSetting>,
    ) -> Outcome<SasStatus> {
        Outcome::from_result(self.sas_set_output_inner(state, setting).await)
    }

    async fn sas_set_output_inner(
        &self,
        state: OutputState,
        setting: Option<OutputSetting>,
    ) -> AppResult<SasStatus> {
        let setting = setting.unwrap_or(self.sas_output);
        let mut sas = self.sas()?.lock().await;
        Ok(sas.set_output(state, Some(setting)).await?)
    }

    pub async fn sas_poll(&self) -> Outcome<SasStatus> {
        Outcome::from_result(self.sas_poll_inner().await)
    }

    async fn sas_poll_inner(&self) -> AppResult<SasStatus> {
        Ok(self.sas()?.lock().await.poll_telemetry().await)
    }

    pub async fn sas_start_repeat(
        &self,
        output: Option<OutputSetting>,
        repeat: Option<RepeatSetting>,
    ) -> Outcome<SasStatus> {
        Outcome::from_result(self.sas_start_repeat_inner(output, repeat).await)
    }

    async fn sas_start_repeat_inner(
        &self,
        output: Option<OutputSetting>,
        repeat: Option<RepeatSetting>,
    ) -> AppResult<SasStatus> {
        let sas = self.sas()?;
        let output = output.unwrap_or(self.sas_output);
        let repeat = repeat.unwrap_or(self.sas_repeat);
        Ok(ArraySimulator::start_repeating(sas, output, repeat).await?)
    }

    pub async fn sas_stop_repeat(&self) -> Outcome<SasStatus> {
        Outcome::from_result(self.sas_stop_repeat_inner().await)
    }

    async fn sas_stop_repeat_inner(&self) -> AppResult<SasStatus> {
        Ok(self.sas()?.lock().await.stop_repeating().await?)
    }

    // ------------------------------------------------------------------
    // Data logger
    // ------------------------------------------------------------------

    pub async fn connect_data_logger(&self) -> Outcome<bool> {
        Outcome::from_result(connect(&self.data_logger, DATA_LOGGER).await)
    }

    pub async fn disconnect_data_logger(&self) -> Outcome<bool> {
        Outcome::from_result(disconnect(&self.data_logger, DATA_LOGGER).await)
    }

    /// Start (`true`) or stop recording; returns the recording flag.
    pub async fn data_logger_record(&self, start: bool) -> Outcome<bool> {
        Outcome::from_result(self.data_logger_record_inner(start).await)
    }

    async fn data_logger_record_inner(&self, start: bool) -> AppResult<bool> {
        let mut logger = require(&self.data_logger, DATA_LOGGER)?.lock().await;
        let recording = if start {
            logger.record_start().await?
        } else {
            logger.record_stop().await?
        };
        Ok(recording)
    }

    /// Measurement bytes with the identity tail removed.
    pub async fn data_logger_fetch(&self, all: bool) -> Outcome<Vec<u8>> {
        Outcome::from_result(self.data_logger_fetch_inner(all).await)
    }

    async fn data_logger_fetch_inner(&self, all: bool) -> AppResult<Vec<u8>> {
        let mut logger = require(&self.data_logger, DATA_LOGGER)?.lock().await;
        let raw = if all {
            logger.fetch_all_data().await?
        } else {
            logger.fetch_one_data().await?
        };
        let raw = require_data(raw, DATA_LOGGER)?;
        let data = require_data(strip_identity_tail(&raw), DATA_LOGGER)?;
        Ok(data.to_vec())
    }

    fn logger_ftp(&self) -> AppResult<&LoggerFtpClient> {
        self.logger_ftp
            .as_ref()
            .ok_or(GseError::InstrumentUnavailable(LOGGER_FTP))
    }

    /// File names on the logger's memory card under `path`.
    pub async fn data_logger_list_files(&self, path: &str) -> Outcome<Vec<String>> {
        Outcome::from_result(self.data_logger_list_files_inner(path).await)
    }

    async fn data_logger_list_files_inner(&self, path: &str) -> AppResult<Vec<String>> {
        Ok(self.logger_ftp()?.list_dir(path).await?)
    }

    /// Copy one file off the logger's memory card; returns its size in bytes.
    pub async fn data_logger_download(&self, remote_path: &str, local: &Path) -> Outcome<u64> {
        Outcome::from_result(self.data_logger_download_inner(remote_path, local).await)
    }

    async fn data_logger_download_inner(&self, remote_path: &str, local: &Path) -> AppResult<u64> {
        Ok(self.logger_ftp()?.get_file(remote_path, local).await?)
    }

    pub async fn data_logger_configure(
        &self,
        channel: &str,
        input: Option<InputType>,
        range: Option<VoltageRange>,
        sampling: Option<SamplingInterval>,
    ) -> Outcome<bool> {
        Outcome::from_result(
            self.data_logger_configure_inner(channel, input, range, sampling)
                .await,
        )
    }

    async fn data_logger_configure_inner(
        &self,
        channel: &str,
        input: Option<InputType>,
        range: Option<VoltageRange>,
        sampling: Option<SamplingInterval>,
    ) -> AppResult<bool> {
        let mut logger = require(&self.data_logger, DATA_LOGGER)?.lock().await;
        let mut sent = true;
        if let Some(input) = input {
            sent &= logger.set_input(channel, input).await?;
        }
        if let Some(range) = range {
            sent &= logger.set_range(channel, range).await?;
        }
        if let Some(sampling) = sampling {
            sent &= logger.set_sampling(sampling).await?;
        }
        Ok(sent)
    }

    // ------------------------------------------------------------------
    // Power sensor
    // ------------------------------------------------------------------

    pub async fn connect_power_sensor(&self) -> Outcome<bool> {
        Outcome::from_result(connect(&self.power_sensor, POWER_SENSOR).await)
    }

    pub async fn disconnect_power_sensor(&self) -> Outcome<bool> {
        Outcome::from_result(disconnect(&self.power_sensor, POWER_SENSOR).await)
    }

    /// One power reading in dBm.
    pub async fn power_reading(&self) -> Outcome<f64> {
        Outcome::from_result(self.power_reading_inner().await)
    }

    async fn power_reading_inner(&self) -> AppResult<f64> {
        let mut sensor = require(&self.power_sensor, POWER_SENSOR)?.lock().await;
        require_data(sensor.get_reading().await?, POWER_SENSOR)
    }

    // ------------------------------------------------------------------
    // Spectrum analyzer
    // ------------------------------------------------------------------

    pub async fn connect_spectrum_analyzer(&self) -> Outcome<bool> {
        Outcome::from_result(connect(&self.spectrum_analyzer, SPECTRUM_ANALYZER).await)
    }

    pub async fn disconnect_spectrum_analyzer(&self) -> Outcome<bool> {
        Outcome::from_result(disconnect(&self.spectrum_analyzer, SPECTRUM_ANALYZER).await)
    }

    pub async fn spectrum_restart(&self) -> Outcome<bool> {
        Outcome::from_result(self.spectrum_restart_inner().await)
    }

    async fn spectrum_restart_inner(&self) -> AppResult<bool> {
        let mut analyzer = require(&self.spectrum_analyzer, SPECTRUM_ANALYZER)?.lock().await;
        Ok(analyzer.restart().await?)
    }

    pub async fn spectrum_trace(&self, trace: u8) -> Outcome<FreqResponse> {
        Outcome::from_result(self.spectrum_trace_inner(trace).await)
    }

    async fn spectrum_trace_inner(&self, trace: u8) -> AppResult<FreqResponse> {
        let mut analyzer = require(&self.spectrum_analyzer, SPECTRUM_ANALYZER)?.lock().await;
        require_data(analyzer.get_data(trace).await?, SPECTRUM_ANALYZER)
    }

    /// Screenshot PNG bytes.
    pub async fn spectrum_capture(&self, name: &str, delete_after: bool) -> Outcome<Vec<u8>> {
        Outcome::from_result(self.spectrum_capture_inner(name, delete_after).await)
    }

    async fn spectrum_capture_inner(&self, name: &str, delete_after: bool) -> AppResult<Vec<u8>> {
        let mut analyzer = require(&self.spectrum_analyzer, SPECTRUM_ANALYZER)?.lock().await;
        require_data(analyzer.get_capture(name, delete_after).await?, SPECTRUM_ANALYZER)
    }

    /// Take a screenshot and write it to `<dir>/<name>.png`.
    pub async fn spectrum_save_capture(
        &self,
        name: &str,
        delete_after: bool,
        dir: &Path,
    ) -> Outcome<PathBuf> {
        Outcome::from_result(self.spectrum_save_capture_inner(name, delete_after, dir).await)
    }

    async fn spectrum_save_capture_inner(
        &self,
        name: &str,
        delete_after: bool,
        dir: &Path,
    ) -> AppResult<PathBuf> {
        let png = self.spectrum_capture_inner(name, delete_after).await?;
        let path = dir.join(format!("{}.png", name));
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|err| GseError::Unexpected(format!("{}: {}", dir.display(), err)))?;
        tokio::fs::write(&path, &png)
            .await
            .map_err(|err| GseError::Unexpected(format!("{}: {}", path.display(), err)))?;
        info!("Saved capture to {}", path.display());
        Ok(path)
    }

    // ------------------------------------------------------------------
    // Remote host
    // ------------------------------------------------------------------

    fn remote(&self) -> AppResult<&RemoteHost> {
        self.remote
            .as_ref()
            .ok_or(GseError::InstrumentUnavailable(REMOTE_HOST))
    }

    pub async fn remote_exists(&self, path: &str) -> Outcome<bool> {
        Outcome::from_result(self.remote_exists_inner(path).await)
    }

    async fn remote_exists_inner(&self, path: &str) -> AppResult<bool> {
        Ok(self.remote()?.adapter.exists(path).await?)
    }

    pub async fn remote_list(&self, path: &str) -> Outcome<Vec<String>> {
        Outcome::from_result(self.remote_list_inner(path).await)
    }

    async fn remote_list_inner(&self, path: &str) -> AppResult<Vec<String>> {
        Ok(self.remote()?.adapter.list_directory(path).await?)
    }

    pub async fn remote_make_dir(&self, path: &str) -> Outcome<bool> {
        Outcome::from_result(self.remote_make_dir_inner(path).await)
    }

    async fn remote_make_dir_inner(&self, path: &str) -> AppResult<bool> {
        Ok(self.remote()?.adapter.make_directory_recursive(path).await?)
    }

    pub async fn remote_delete_dir(&self, path: &str) -> Outcome<CommandOutput> {
        Outcome::from_result(self.remote_delete_dir_inner(path).await)
    }

    async fn remote_delete_dir_inner(&self, path: &str) -> AppResult<CommandOutput> {
        Ok(self.remote()?.adapter.delete_directory(path).await?)
    }

    pub async fn remote_fetch(&self, remote_path: &str, local: &Path) -> Outcome<u64> {
        Outcome::from_result(self.remote_fetch_inner(remote_path, local).await)
    }

    async fn remote_fetch_inner(&self, remote_path: &str, local: &Path) -> AppResult<u64> {
        Ok(self.remote()?.adapter.fetch_file(remote_path, local).await?)
    }

    pub async fn remote_run_script(&self, session_name: &str) -> Outcome<CommandOutput> {
        Outcome::from_result(self.remote_run_script_inner(session_name).await)
    }

    async fn remote_run_script_inner(&self, session_name: &str) -> AppResult<CommandOutput> {
        let remote = self.remote()?;
        Ok(remote
            .adapter
            .run_script(&remote.script_dir, &remote.script, session_name)
            .await?)
    }

    // ------------------------------------------------------------------
    // Recorder and modem
    // ------------------------------------------------------------------

    pub async fn recorder_start(
        &self,
        session_name: &str,
        description: &str,
        duration_s: i64,
    ) -> Outcome<bool> {
        Outcome::from_result(
            self.recorder_start_inner(session_name, description, duration_s)
                .await,
        )
    }

    async fn recorder_start_inner(
        &self,
        session_name: &str,
        description: &str,
        duration_s: i64,
    ) -> AppResult<bool> {
        let recorder = self
            .recorder
            .as_ref()
            .ok_or(GseError::InstrumentUnavailable(RECORDER))?;
        Ok(recorder
            .start_recording(session_name, description, duration_s)
            .await?)
    }

    pub async fn recorder_stop(&self) -> Outcome<u16> {
        Outcome::from_result(self.recorder_stop_inner().await)
    }

    async fn recorder_stop_inner(&self) -> AppResult<u16> {
        let recorder = self
            .recorder
            .as_ref()
            .ok_or(GseError::InstrumentUnavailable(RECORDER))?;
        Ok(recorder.stop_recording().await?)
    }

    pub async fn modem_set_modcod(&self, modcod: u8) -> Outcome<u16> {
        Outcome::from_result(self.modem_set_modcod_inner(modcod).await)
    }

    async fn modem_set_modcod_inner(&self, modcod: u8) -> AppResult<u16> {
        let modem = self
            .modem
            .as_ref()
            .ok_or(GseError::InstrumentUnavailable(MODEM))?;
        Ok(modem.set_modcod(modcod).await?)
    }

    // ------------------------------------------------------------------
    // Procedures
    // ------------------------------------------------------------------

    /// Start an observation run in the background; returns its run id.
    pub fn start_observation(&self, plan: Option<ObservationPlan>) -> Outcome<Uuid> {
        Outcome::from_result(self.start_observation_inner(plan))
    }

    fn start_observation_inner(&self, plan: Option<ObservationPlan>) -> AppResult<Uuid> {
        let sensor = Arc::clone(require(&self.power_sensor, POWER_SENSOR)?);
        let analyzer = self.spectrum_analyzer.clone();
        let plan = plan.unwrap_or(self.observation_plan);
        Ok(self
            .observation
            .start(move |token| run_observation(sensor, analyzer, plan, token))?)
    }

    pub fn cancel_observation(&self) -> Outcome<bool> {
        Outcome::from_result(self.observation.cancel().map(|_| true).map_err(GseError::from))
    }

    pub fn observation_busy(&self) -> bool {
        self.observation.is_busy()
    }

    pub fn observation_report(&self) -> Outcome<ProcedureReport<ObservationResult>> {
        Outcome::from_result(require_data(self.observation.last_report(), "Observation"))
    }

    /// Run the processing script for `session_name` and fetch `output_dir`.
    pub fn start_remote_processing(
        &self,
        session_name: &str,
        output_dir: &str,
        local_dir: &Path,
    ) -> Outcome<Uuid> {
        Outcome::from_result(self.start_remote_processing_inner(session_name, output_dir, local_dir))
    }

    fn start_remote_processing_inner(
        &self,
        session_name: &str,
        output_dir: &str,
        local_dir: &Path,
    ) -> AppResult<Uuid> {
        let remote = self.remote()?;
        let adapter = remote.adapter.clone();
        let request = ProcessingRequest {
            session_name: session_name.to_string(),
            script_dir: remote.script_dir.clone(),
            script: remote.script.clone(),
            output_dir: output_dir.to_string(),
            local_dir: local_dir.to_path_buf(),
        };
        Ok(self
            .processing
            .start(move |token| run_remote_processing(adapter, request, token))?)
    }

    pub fn cancel_remote_processing(&self) -> Outcome<bool> {
        Outcome::from_result(self.processing.cancel().map(|_| true).map_err(GseError::from))
    }

    pub fn remote_processing_busy(&self) -> bool {
        self.processing.is_busy()
    }

    pub fn remote_processing_report(&self) -> Outcome<ProcedureReport<ProcessingResult>> {
        Outcome::from_result(require_data(self.processing.last_report(), "Remote processing"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_hides_unexpected_detail() {
        let outcome: Outcome<()> =
            Outcome::from_result(Err(GseError::Unexpected("disk on fire".into())));
        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some(UNEXPECTED_MESSAGE));
    }

    #[test]
    fn test_outcome_serializes_without_empty_fields() {
        let json = serde_json::to_string(&Outcome::ok(true)).unwrap();
        assert_eq!(json, r#"{"success":true,"data":true}"#);
        let json = serde_json::to_string(&Outcome::<bool>::failure("Bus jig is not open")).unwrap();
        assert_eq!(json, r#"{"success":false,"error":"Bus jig is not open"}"#);
    }

    #[tokio::test]
    async fn test_unconfigured_workbench_reports_unavailable() {
        let bench = Workbench::from_settings(None);
        let outcome = bench.power_reading().await;
        assert!(!outcome.success);
        assert_eq!(
            outcome.error.as_deref(),
            Some("Power sensor is unavailable (not configured)")
        );
        assert!(!bench.connect_bus_jig().await.success);
        assert!(!bench.start_observation(None).success);
        assert!(!bench.remote_exists("x").await.success);
        assert_eq!(
            bench.data_logger_list_files("SD1").await.error.as_deref(),
            Some("Data logger FTP is unavailable (not configured)")
        );
    }
}
