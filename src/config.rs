//! Bench configuration using Figment.
//!
//! Configuration is loaded once at process start from:
//! 1. a TOML or JSON settings document (chosen by file extension)
//! 2. environment variables prefixed with `GSE_DAQ_`, nested keys joined by `__`
//!
//! ```text
//! GSE_DAQ_APPLICATION__LOG_LEVEL=debug
//! GSE_DAQ_ARRAY_SIMULATOR__SERIAL__PORT=/dev/ttyUSB1
//! GSE_DAQ_POWER_SENSOR__RESOURCE=TCPIP0::192.168.1.30::5025::SOCKET
//! ```
//!
//! Every instrument section is optional. An absent section means that
//! instrument is unavailable; a malformed document fails to load entirely.

use crate::instrument::array_simulator::RepeatSetting;
use crate::protocol::sas_frame::OutputSetting;
use crate::transport::parse_resource;
use figment::{
    providers::{Env, Format, Json, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration load error: {0}")]
    LoadError(#[from] figment::Error),
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level bench configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub application: ApplicationConfig,
    #[serde(default)]
    pub bus_jig: Option<BusJigConfig>,
    #[serde(default)]
    pub array_simulator: Option<ArraySimulatorConfig>,
    #[serde(default)]
    pub data_logger: Option<DataLoggerConfig>,
    #[serde(default)]
    pub power_sensor: Option<ScpiInstrumentConfig>,
    #[serde(default)]
    pub spectrum_analyzer: Option<SpectrumAnalyzerConfig>,
    #[serde(default)]
    pub recorder: Option<RecorderConfig>,
    #[serde(default)]
    pub modem: Option<ModemConfig>,
    #[serde(default)]
    pub observation: ObservationConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: LogFormat::default(),
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Serial line parity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Parity {
    #[default]
    #[serde(rename = "N", alias = "none")]
    None,
    #[serde(rename = "E", alias = "even")]
    Even,
    #[serde(rename = "O", alias = "odd")]
    Odd,
}

/// Serial port parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Port name (e.g., "/dev/ttyUSB0", "COM3")
    pub port: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default)]
    pub parity: Parity,
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    /// Bound on readiness waits and reads
    #[serde(default = "default_serial_timeout")]
    pub timeout_ms: u64,
    /// Driver-level write timeout
    #[serde(default = "default_serial_timeout")]
    pub write_timeout_ms: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: default_baud_rate(),
            parity: Parity::None,
            data_bits: default_data_bits(),
            stop_bits: default_stop_bits(),
            timeout_ms: default_serial_timeout(),
            write_timeout_ms: default_serial_timeout(),
        }
    }
}

impl SerialConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusJigConfig {
    pub serial: SerialConfig,
}

/// Solar-array simulator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArraySimulatorConfig {
    pub serial: SerialConfig,
    /// Output setting applied when none is supplied
    #[serde(default)]
    pub output: OutputSetting,
    /// Repeat parameters applied when none are supplied
    #[serde(default)]
    pub repeat: RepeatSetting,
}

/// VISA/SCPI instrument address
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScpiInstrumentConfig {
    /// VISA resource (e.g., "TCPIP0::192.168.1.30::5025::SOCKET")
    pub resource: String,
    #[serde(default = "default_scpi_timeout")]
    pub timeout_ms: u64,
}

impl ScpiInstrumentConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// GL840 control address plus the FTP server on its memory card
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataLoggerConfig {
    pub resource: String,
    #[serde(default = "default_scpi_timeout")]
    pub timeout_ms: u64,
    /// Anonymous FTP endpoint, usually port 21
    #[serde(default)]
    pub ftp: Option<NetworkConfig>,
}

impl DataLoggerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpectrumAnalyzerConfig {
    pub resource: String,
    #[serde(default = "default_scpi_timeout")]
    pub timeout_ms: u64,
    /// Screenshot directory on the analyzer's own file system
    pub capture_dir: String,
}

impl SpectrumAnalyzerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Host and port of a REST, SSH or FTP endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub host: String,
    pub port: u16,
}

/// Shell/file-transfer access to the recorder appliance.
#[derive(Clone, Serialize, Deserialize)]
pub struct SshConfig {
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub username: String,
    /// Usually supplied through `GSE_DAQ_RECORDER__SSH__PASSWORD`
    #[serde(default, skip_serializing)]
    pub password: String,
    /// Working directory for the processing script, relative to home
    #[serde(default)]
    pub script_dir: String,
    /// Processing script, relative to home
    #[serde(default)]
    pub script: String,
}

impl fmt::Debug for SshConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("script_dir", &self.script_dir)
            .field("script", &self.script)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecorderConfig {
    pub rest: NetworkConfig,
    #[serde(default)]
    pub ssh: Option<SshConfig>,
    #[serde(default = "default_rest_timeout")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModemConfig {
    pub rest: NetworkConfig,
    #[serde(default = "default_modem_timeout")]
    pub timeout_ms: u64,
}

/// Observation capture defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservationConfig {
    /// Seconds to wait before the first sample
    #[serde(default)]
    pub warmup_s: u64,
    #[serde(default = "default_samples")]
    pub samples: u32,
    #[serde(default = "default_sample_interval")]
    pub sample_interval_ms: u64,
    /// Also read spectrum trace 1 at the end of the run
    #[serde(default = "default_true")]
    pub capture_trace: bool,
}

impl Default for ObservationConfig {
    fn default() -> Self {
        Self {
            warmup_s: 0,
            samples: default_samples(),
            sample_interval_ms: default_sample_interval(),
            capture_trace: true,
        }
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_name() -> String {
    "gse_daq".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

fn default_serial_timeout() -> u64 {
    1000
}

fn default_scpi_timeout() -> u64 {
    5000
}

fn default_ssh_port() -> u16 {
    22
}

fn default_rest_timeout() -> u64 {
    1000
}

fn default_modem_timeout() -> u64 {
    5000
}

fn default_samples() -> u32 {
    10
}

fn default_sample_interval() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl Settings {
    /// Load settings from a TOML or JSON file plus `GSE_DAQ_` environment
    /// overrides, then validate.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

        let figment = if is_json {
            Figment::new().merge(Json::file(path))
        } else {
            Figment::new().merge(Toml::file(path))
        };

        let settings: Self = figment
            .merge(Env::prefixed("GSE_DAQ_").split("__"))
            .extract()
            .map_err(ConfigError::LoadError)?;

        settings.validate()?;
        Ok(settings)
    }

    /// Validate settings after loading.
    ///
    /// Checks log level, serial line parameters, instrument addresses,
    /// default output/repeat settings and network endpoints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if let Some(bus_jig) = &self.bus_jig {
            validate_serial("bus_jig", &bus_jig.serial)?;
        }

        if let Some(sas) = &self.array_simulator {
            validate_serial("array_simulator", &sas.serial)?;
            sas.output.validate().map_err(|err| {
                ConfigError::ValidationError(format!("array_simulator.output: {}", err))
            })?;
            sas.repeat.validate().map_err(|reason| {
                ConfigError::ValidationError(format!("array_simulator.repeat: {}", reason))
            })?;
        }

        for (section, resource) in [
            ("data_logger", self.data_logger.as_ref().map(|c| &c.resource)),
            ("power_sensor", self.power_sensor.as_ref().map(|c| &c.resource)),
            (
                "spectrum_analyzer",
                self.spectrum_analyzer.as_ref().map(|c| &c.resource),
            ),
        ] {
            if let Some(resource) = resource {
                parse_resource(resource).map_err(|err| {
                    ConfigError::ValidationError(format!("{}: {}", section, err))
                })?;
            }
        }

        if let Some(ftp) = self.data_logger.as_ref().and_then(|c| c.ftp.as_ref()) {
            validate_network("data_logger.ftp", ftp)?;
        }

        if let Some(recorder) = &self.recorder {
            validate_network("recorder.rest", &recorder.rest)?;
            if let Some(ssh) = &recorder.ssh {
                if ssh.host.is_empty() || ssh.port == 0 || ssh.username.is_empty() {
                    return Err(ConfigError::ValidationError(
                        "recorder.ssh: 'host', 'port' and 'username' are required".to_string(),
                    ));
                }
            }
        }

        if let Some(modem) = &self.modem {
            validate_network("modem.rest", &modem.rest)?;
        }

        if self.observation.sample_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "observation.sample_interval_ms must be > 0".to_string(),
            ));
        }

        Ok(())
    }
}

fn validate_serial(section: &str, serial: &SerialConfig) -> Result<(), ConfigError> {
    if serial.port.is_empty() {
        return Err(ConfigError::ValidationError(format!(
            "{}.serial: 'port' cannot be empty",
            section
        )));
    }
    if serial.baud_rate == 0 {
        return Err(ConfigError::ValidationError(format!(
            "{}.serial: 'baud_rate' must be > 0",
            section
        )));
    }
    if !(5..=8).contains(&serial.data_bits) {
        return Err(ConfigError::ValidationError(format!(
            "{}.serial: invalid data_bits {}. Must be 5-8",
            section, serial.data_bits
        )));
    }
    if !matches!(serial.stop_bits, 1 | 2) {
        return Err(ConfigError::ValidationError(format!(
            "{}.serial: invalid stop_bits {}. Must be 1 or 2",
            section, serial.stop_bits
        )));
    }
    if serial.timeout_ms == 0 {
        return Err(ConfigError::ValidationError(format!(
            "{}.serial: 'timeout_ms' must be > 0",
            section
        )));
    }
    Ok(())
}

fn validate_network(section: &str, network: &NetworkConfig) -> Result<(), ConfigError> {
    if network.host.is_empty() || network.port == 0 {
        return Err(ConfigError::ValidationError(format!(
            "{}: 'host' and a non-zero 'port' are required",
            section
        )));
    }
    Ok(())
}
