//! Insomnia CLI Application

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand, ValueEnum};
use insomnia_core::domain::audio::{AudioEnumerator, DeviceInfo};
use insomnia_core::domain::config::{AppConfig, ConfigManager};
use insomnia_core::domain::scheduler::{
    CandidateMode, IdleBehavior, KeepAliveError, KeepAliveScheduler, StopReason,
};
use insomnia_infra::audio::{CpalEnumerator, CpalSink};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "insomnia")]
#[command(about = "Keeps Bluetooth speakers awake with a near-inaudible tone", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (default: <config dir>/insomnia/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Keep matched speakers awake until interrupted (default)
    Run(RunArgs),

    /// List host output devices and which profile each one matches
    Devices {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the known device profiles and configured aliases
    Profiles,

    /// Write a starter config file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Args, Default)]
struct RunArgs {
    /// Which devices to consider
    #[arg(long, value_enum)]
    mode: Option<Mode>,

    /// Host name of the speaker to keep awake
    #[arg(short, long)]
    target: Option<String>,

    /// Match devices once at startup instead of rescanning
    #[arg(long, conflicts_with = "rescan_secs")]
    once: bool,

    /// Seconds between device rescans
    #[arg(long)]
    rescan_secs: Option<u64>,

    /// Exit instead of waiting when no target device is present
    #[arg(long)]
    exit_when_idle: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum Mode {
    DefaultDevice,
    AllDevices,
}

impl From<Mode> for CandidateMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::DefaultDevice => CandidateMode::DefaultDevice,
            Mode::AllDevices => CandidateMode::AllDevices,
        }
    }
}

#[derive(Serialize)]
struct DeviceListing<'a> {
    #[serde(flatten)]
    device: &'a DeviceInfo,
    is_default: bool,
    profile: Option<&'static str>,
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// File values, then `.env` / process environment on top
async fn load_config(path: Option<PathBuf>) -> anyhow::Result<AppConfig> {
    let manager = match path {
        Some(path) => ConfigManager::with_path(path),
        None => ConfigManager::new(ConfigManager::default_config_dir()?),
    };

    let mut config = manager.load().await.map_err(KeepAliveError::from)?;
    config
        .apply_env(|key| std::env::var(key).ok())
        .map_err(KeepAliveError::from)?;
    Ok(config)
}

async fn run(mut config: AppConfig, args: RunArgs) -> anyhow::Result<()> {
    if let Some(target) = &args.target {
        config.add_target(target).map_err(KeepAliveError::from)?;
    }
    if let Some(mode) = args.mode {
        config.scheduler.mode = mode.into();
    }
    if args.once {
        config.scheduler.rescan_interval_secs = 0;
    } else if let Some(secs) = args.rescan_secs {
        config.scheduler.rescan_interval_secs = secs;
    }
    if args.exit_when_idle {
        config.scheduler.when_idle = IdleBehavior::Exit;
    }

    config.validate().map_err(KeepAliveError::from)?;
    let registry = Arc::new(config.registry().map_err(KeepAliveError::from)?);

    let enumerator = Arc::new(CpalEnumerator::new());
    info!(host = enumerator.host_name(), "Audio host ready");

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("Shutdown signal received; stopping after current playback");
                let _ = stop_tx.send(true);
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Second shutdown signal received; forcing exit");
                    std::process::exit(130);
                }
            }
            Err(e) => {
                // Keep the sender alive so the scheduler is not stopped
                error!(error = %e, "Unable to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
        }
    });

    let scheduler = KeepAliveScheduler::new(
        enumerator,
        Arc::new(CpalSink::default()),
        registry,
        config.scheduler_settings(),
    );
    let report = scheduler.run(stop_rx).await?;

    for device in &report.devices {
        info!(
            device = %device.device,
            model = %device.model,
            cycles = device.cycles,
            failures = device.failures,
            "Device summary"
        );
    }

    match report.stop_reason {
        StopReason::Interrupted => info!("Exiting application"),
        StopReason::Idle => info!("Nothing to keep awake"),
    }
    Ok(())
}

fn list_devices(config: &AppConfig, json: bool) -> anyhow::Result<()> {
    let registry = config.registry().map_err(KeepAliveError::from)?;
    let enumerator = CpalEnumerator::new();
    let devices = enumerator
        .output_devices()
        .map_err(KeepAliveError::AudioSubsystemInit)?;
    let default = enumerator.default_output_device().ok().map(|d| d.id);

    let listings: Vec<DeviceListing<'_>> = devices
        .iter()
        .map(|device| DeviceListing {
            device,
            is_default: default.as_ref() == Some(&device.id),
            profile: registry
                .resolve(device.id.as_str())
                .map(|profile| profile.model().key()),
        })
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&listings)?);
        return Ok(());
    }

    if listings.is_empty() {
        println!("No output devices found on {}", enumerator.host_name());
        return Ok(());
    }

    for listing in &listings {
        let device = listing.device;
        println!(
            "{:>3} {} {:<40} {:>2} ch {:>6} Hz  {}",
            device.index,
            if listing.is_default { "*" } else { " " },
            device.name,
            device.max_output_channels,
            device
                .default_sample_rate
                .map(|rate| rate.hz().to_string())
                .unwrap_or_else(|| "?".to_string()),
            listing.profile.unwrap_or("-"),
        );
    }
    Ok(())
}

fn list_profiles(config: &AppConfig) -> anyhow::Result<()> {
    let registry = config.registry().map_err(KeepAliveError::from)?;

    for profile in registry.profiles() {
        let tone = profile.frequency_configuration();
        println!(
            "{} ({}): every {}s, {} Hz for {}s at {} Hz, amplitude {}",
            profile.model(),
            profile.model().key(),
            profile.interval_secs(),
            tone.frequency(),
            tone.duration(),
            tone.sample_rate(),
            tone.amplitude(),
        );
    }

    for (name, model) in registry.aliases() {
        println!("  \"{}\" -> {}", name, model.key());
    }
    Ok(())
}

async fn init_config(path: Option<PathBuf>, force: bool) -> anyhow::Result<()> {
    let manager = match path {
        Some(path) => ConfigManager::with_path(path),
        None => ConfigManager::new(ConfigManager::default_config_dir()?),
    };

    if manager.exists() && !force {
        bail!(
            "{} already exists (use --force to overwrite)",
            manager.config_path().display()
        );
    }

    manager
        .save(&AppConfig::factory_default())
        .await
        .with_context(|| format!("writing {}", manager.config_path().display()))?;
    println!("Wrote {}", manager.config_path().display());
    Ok(())
}

async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    match cli.command.unwrap_or(Command::Run(RunArgs::default())) {
        Command::InitConfig { force } => init_config(cli.config, force).await,
        Command::Run(args) => run(load_config(cli.config).await?, args).await,
        Command::Devices { json } => list_devices(&load_config(cli.config).await?, json),
        Command::Profiles => list_profiles(&load_config(cli.config).await?),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // A missing .env file is normal
    let _ = dotenvy::dotenv();
    init_logging(cli.verbose);

    match dispatch(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let code = err
                .downcast_ref::<KeepAliveError>()
                .map(KeepAliveError::exit_code)
                .unwrap_or(1);

            if code == 0 {
                info!("{}", err);
                ExitCode::SUCCESS
            } else {
                error!("An error occurred: {:#}", err);
                ExitCode::from(code as u8)
            }
        }
    }
}
