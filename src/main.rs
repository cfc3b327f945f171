//! `gse_daq` command-line entry point.
//!
//! Loads the bench configuration, builds a [`Workbench`] and runs one
//! operation, printing its JSON outcome.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gse_daq::config::{ApplicationConfig, Settings};
use gse_daq::instrument::data_logger::{InputType, SamplingInterval, VoltageRange};
use gse_daq::instrument::RepeatSetting;
use gse_daq::logging;
use gse_daq::procedure::ObservationPlan;
use gse_daq::protocol::sas_frame::{OutputSetting, OutputState};
use gse_daq::workbench::{Outcome, Workbench};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(author, version, about = "Ground-support test bench control", long_about = None)]
struct Cli {
    /// Bench configuration (TOML or JSON)
    #[arg(short, long, default_value = "config/gse_daq.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Satellite bus power jig
    #[command(subcommand)]
    BusJig(BusJigCommand),
    /// Solar-array simulator
    #[command(subcommand)]
    Sas(SasCommand),
    /// GL840 data logger
    #[command(subcommand)]
    Logger(LoggerCommand),
    /// GL840 memory card over FTP
    #[command(subcommand)]
    LoggerFiles(LoggerFilesCommand),
    /// Read the power sensor once
    Power,
    /// Signal analyzer
    #[command(subcommand)]
    Spectrum(SpectrumCommand),
    /// Recorder shell access
    #[command(subcommand)]
    Remote(RemoteCommand),
    /// Recorder REST control
    #[command(subcommand)]
    Recorder(RecorderCommand),
    /// Set the modem's expected MODCOD (13 or 15)
    Modcod { modcod: u8 },
    /// Run an observation capture and wait for its report
    Observe {
        #[arg(long)]
        samples: Option<u32>,
        #[arg(long)]
        interval_ms: Option<u64>,
        #[arg(long)]
        warmup_s: Option<u64>,
    },
    /// Run the recorder processing script and fetch its outputs
    Process {
        session: String,
        output_dir: String,
        local_dir: PathBuf,
    },
}

#[derive(Debug, Subcommand)]
enum BusJigCommand {
    Enable,
    Disable,
    Status,
}

#[derive(Debug, clap::Args)]
struct SettingArgs {
    #[arg(long)]
    voc: Option<f64>,
    #[arg(long)]
    isc: Option<f64>,
    #[arg(long)]
    fill_factor: Option<f64>,
}

impl SettingArgs {
    fn to_setting(&self) -> Option<OutputSetting> {
        if self.voc.is_none() && self.isc.is_none() && self.fill_factor.is_none() {
            return None;
        }
        let default = OutputSetting::default();
        Some(OutputSetting {
            voc: self.voc.unwrap_or(default.voc),
            isc: self.isc.unwrap_or(default.isc),
            fill_factor: self.fill_factor.unwrap_or(default.fill_factor),
        })
    }
}

#[derive(Debug, Subcommand)]
enum SasCommand {
    On(SettingArgs),
    Off,
    Poll,
    /// Run repeat mode for a while, then switch off
    Repeat {
        #[command(flatten)]
        setting: SettingArgs,
        #[arg(long)]
        orbit_period: Option<u64>,
        #[arg(long)]
        sun_rate: Option<f64>,
        #[arg(long)]
        offset: Option<u64>,
        #[arg(long, default_value_t = 60)]
        run_s: u64,
    },
}

#[derive(Debug, Subcommand)]
enum LoggerCommand {
    Start,
    Stop,
    /// Fetch buffered data (`--all`) or the newest record
    Fetch {
        #[arg(long)]
        all: bool,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    Configure {
        channel: String,
        #[arg(long)]
        input: Option<InputType>,
        #[arg(long)]
        range: Option<VoltageRange>,
        #[arg(long)]
        sampling: Option<SamplingInterval>,
    },
}

#[derive(Debug, Subcommand)]
enum LoggerFilesCommand {
    List {
        #[arg(default_value = "/")]
        path: String,
    },
    Download { remote: String, local: PathBuf },
}

#[derive(Debug, Subcommand)]
enum SpectrumCommand {
    Restart,
    Trace {
        #[arg(default_value_t = 1)]
        trace: u8,
    },
    Capture {
        name: String,
        dir: PathBuf,
        /// Keep the screenshot on the analyzer
        #[arg(long)]
        keep: bool,
    },
}

#[derive(Debug, Subcommand)]
enum RemoteCommand {
    Exists { path: String },
    List { path: String },
    Mkdir { path: String },
    Delete { path: String },
    Fetch { remote: String, local: PathBuf },
    RunScript { session: String },
}

#[derive(Debug, Subcommand)]
enum RecorderCommand {
    Start {
        session: String,
        #[arg(long, default_value = "")]
        description: String,
        #[arg(long)]
        duration_s: i64,
    },
    Stop,
}

fn print<T: Serialize>(outcome: &Outcome<T>) -> Result<bool> {
    println!(
        "{}",
        serde_json::to_string_pretty(outcome).context("failed to serialize outcome")?
    );
    Ok(outcome.success)
}

/// Print a failed connect outcome; `true` when the session is open.
fn connected(outcome: Outcome<bool>) -> Result<bool> {
    if outcome.success && outcome.data == Some(true) {
        return Ok(true);
    }
    print(&outcome)?;
    Ok(false)
}

async fn wait_for(busy: impl Fn() -> bool) {
    while busy() {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

async fn run(bench: &Workbench, settings: Option<&Settings>, command: Commands) -> Result<bool> {
    match command {
        Commands::BusJig(command) => {
            if !connected(bench.connect_bus_jig().await)? {
                return Ok(false);
            }
            match command {
                BusJigCommand::Enable => print(&bench.bus_jig_enable(true).await),
                BusJigCommand::Disable => print(&bench.bus_jig_enable(false).await),
                BusJigCommand::Status => print(&bench.bus_jig_status().await),
            }
        }
        Commands::Sas(command) => {
            if !connected(bench.connect_array_simulator().await)? {
                return Ok(false);
            }
            match command {
                SasCommand::On(args) => {
                    print(&bench.sas_set_output(OutputState::On, args.to_setting()).await)
                }
                SasCommand::Off => print(&bench.sas_set_output(OutputState::Off, None).await),
                SasCommand::Poll => print(&bench.sas_poll().await),
                SasCommand::Repeat {
                    setting,
                    orbit_period,
                    sun_rate,
                    offset,
                    run_s,
                } => {
                    let configured = settings
                        .and_then(|s| s.array_simulator.as_ref())
                        .map(|sas| sas.repeat)
                        .unwrap_or_default();
                    let repeat = RepeatSetting {
                        orbit_period: orbit_period.unwrap_or(configured.orbit_period),
                        sun_rate: sun_rate.unwrap_or(configured.sun_rate),
                        offset: offset.unwrap_or(configured.offset),
                        interval: configured.interval,
                    };
                    let started = bench.sas_start_repeat(setting.to_setting(), Some(repeat)).await;
                    if !print(&started)? {
                        return Ok(false);
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(run_s)) => {}
                        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
                    }
                    print(&bench.sas_stop_repeat().await)
                }
            }
        }
        Commands::LoggerFiles(command) => match command {
            LoggerFilesCommand::List { path } => {
                print(&bench.data_logger_list_files(&path).await)
            }
            LoggerFilesCommand::Download { remote, local } => {
                print(&bench.data_logger_download(&remote, &local).await)
            }
        },
        Commands::Logger(command) => {
            if !connected(bench.connect_data_logger().await)? {
                return Ok(false);
            }
            match command {
                LoggerCommand::Start => print(&bench.data_logger_record(true).await),
                LoggerCommand::Stop => print(&bench.data_logger_record(false).await),
                LoggerCommand::Fetch { all, out } => {
                    let outcome = bench.data_logger_fetch(all).await;
                    match (&outcome.data, out) {
                        (Some(data), Some(path)) => {
                            tokio::fs::write(&path, data)
                                .await
                                .with_context(|| format!("failed to write {}", path.display()))?;
                            print(&Outcome::ok(path))
                        }
                        _ => print(&outcome),
                    }
                }
                LoggerCommand::Configure {
                    channel,
                    input,
                    range,
                    sampling,
                } => print(
                    &bench
                        .data_logger_configure(&channel, input, range, sampling)
                        .await,
                ),
            }
        }
        Commands::Power => {
            if !connected(bench.connect_power_sensor().await)? {
                return Ok(false);
            }
            print(&bench.power_reading().await)
        }
        Commands::Spectrum(command) => {
            if !connected(bench.connect_spectrum_analyzer().await)? {
                return Ok(false);
            }
            match command {
                SpectrumCommand::Restart => print(&bench.spectrum_restart().await),
                SpectrumCommand::Trace { trace } => print(&bench.spectrum_trace(trace).await),
                SpectrumCommand::Capture { name, dir, keep } => {
                    print(&bench.spectrum_save_capture(&name, !keep, &dir).await)
                }
            }
        }
        Commands::Remote(command) => match command {
            RemoteCommand::Exists { path } => print(&bench.remote_exists(&path).await),
            RemoteCommand::List { path } => print(&bench.remote_list(&path).await),
            RemoteCommand::Mkdir { path } => print(&bench.remote_make_dir(&path).await),
            RemoteCommand::Delete { path } => print(&bench.remote_delete_dir(&path).await),
            RemoteCommand::Fetch { remote, local } => {
                print(&bench.remote_fetch(&remote, &local).await)
            }
            RemoteCommand::RunScript { session } => {
                print(&bench.remote_run_script(&session).await)
            }
        },
        Commands::Recorder(command) => match command {
            RecorderCommand::Start {
                session,
                description,
                duration_s,
            } => print(
                &bench
                    .recorder_start(&session, &description, duration_s)
                    .await,
            ),
            RecorderCommand::Stop => print(&bench.recorder_stop().await),
        },
        Commands::Modcod { modcod } => print(&bench.modem_set_modcod(modcod).await),
        Commands::Observe {
            samples,
            interval_ms,
            warmup_s,
        } => {
            if !connected(bench.connect_power_sensor().await)? {
                return Ok(false);
            }
            let configured = settings.map(|s| s.observation.clone()).unwrap_or_default();
            let mut plan = ObservationPlan::from(&configured);
            if plan.capture_trace && !bench.connect_spectrum_analyzer().await.success {
                plan.capture_trace = false;
            }
            plan.samples = samples.unwrap_or(plan.samples);
            plan.sample_interval = interval_ms
                .map(Duration::from_millis)
                .unwrap_or(plan.sample_interval);
            plan.warmup = warmup_s.map(Duration::from_secs).unwrap_or(plan.warmup);

            if !print(&bench.start_observation(Some(plan)))? {
                return Ok(false);
            }
            tokio::select! {
                _ = wait_for(|| bench.observation_busy()) => {}
                _ = tokio::signal::ctrl_c() => {
                    bench.cancel_observation();
                    wait_for(|| bench.observation_busy()).await;
                }
            }
            print(&bench.observation_report())
        }
        Commands::Process {
            session,
            output_dir,
            local_dir,
        } => {
            if !print(&bench.start_remote_processing(&session, &output_dir, &local_dir))? {
                return Ok(false);
            }
            tokio::select! {
                _ = wait_for(|| bench.remote_processing_busy()) => {}
                _ = tokio::signal::ctrl_c() => {
                    bench.cancel_remote_processing();
                    wait_for(|| bench.remote_processing_busy()).await;
                }
            }
            print(&bench.remote_processing_report())
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let loaded = Settings::load_from(&cli.config).and_then(|settings| {
        settings.validate()?;
        Ok(settings)
    });
    let application = loaded
        .as_ref()
        .map(|settings| settings.application.clone())
        .unwrap_or_else(|_| ApplicationConfig::default());
    logging::init(&application);

    let settings = match loaded {
        Ok(settings) => {
            info!("Loaded configuration from {}", cli.config.display());
            Some(settings)
        }
        Err(err) => {
            error!("Configuration unusable ({}): {}", cli.config.display(), err);
            None
        }
    };

    let bench = Workbench::from_settings(settings.as_ref());
    let success = run(&bench, settings.as_ref(), cli.command).await;
    bench.shutdown().await;

    Ok(if success? {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
