//! Configuration management for Insomnia
//!
//! This module provides:
//! - The TOML configuration file (scheduler mode, device aliases, profile tuning)
//! - Environment overrides (`JBL_DEVICE_TARGET`, `INSOMNIA_MODE`)
//! - Startup validation: a missing target device is fatal before anything plays

use crate::domain::profile::{
    DeviceModel, DeviceProfileRegistry, ProfileError, ProfileOverride, RegistryBuilder,
};
use crate::domain::scheduler::{CandidateMode, IdleBehavior, SchedulerSettings};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, instrument};

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Errors that can occur during configuration operations
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Missing required configuration: {0}")]
    Missing(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Invalid device profile: {0}")]
    Profile(#[from] ProfileError),
}

/// Environment variables read at startup
pub mod env {
    /// Host name of the speaker to keep awake
    pub const DEVICE_TARGET: &str = "JBL_DEVICE_TARGET";
    /// `default-device` or `all-devices`
    pub const MODE: &str = "INSOMNIA_MODE";
}

/// Scheduler section of the config file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub mode: CandidateMode,

    /// Seconds between device enumeration passes (0 = match once at startup)
    pub rescan_interval_secs: u64,

    pub when_idle: IdleBehavior,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            mode: CandidateMode::DefaultDevice,
            rescan_interval_secs: 30,
            when_idle: IdleBehavior::Wait,
        }
    }
}

/// Maps a host device name onto a known speaker model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceAlias {
    pub name: String,
    #[serde(default)]
    pub model: DeviceModel,
}

/// Complete Insomnia configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub scheduler: SchedulerConfig,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub devices: Vec<DeviceAlias>,

    /// Per-model tuning, keyed by model key (e.g. `jbl-charge-3`)
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub profiles: BTreeMap<String, ProfileOverride>,
}

impl AppConfig {
    /// Load configuration from TOML file
    #[instrument(skip(path))]
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = fs::read_to_string(path).await?;
        let config: Self = toml::from_str(&contents)?;

        debug!("Configuration loaded successfully");
        Ok(config)
    }

    /// Save configuration to TOML file
    #[instrument(skip(self, path))]
    pub async fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        info!(path = %path.display(), "Saving configuration");

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let toml_str = toml::to_string_pretty(self)?;
        fs::write(path, toml_str).await?;

        debug!("Configuration saved successfully");
        Ok(())
    }

    /// Starter configuration written by `insomnia init-config`
    pub fn factory_default() -> Self {
        let mut config = Self::default();
        config.devices.push(DeviceAlias {
            name: DeviceModel::JblCharge3.display_name().to_string(),
            model: DeviceModel::JblCharge3,
        });
        config
    }

    /// Apply environment overrides on top of the file values.
    ///
    /// `lookup` is normally `std::env::var(..).ok()`; tests pass a map.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(target) = lookup(env::DEVICE_TARGET) {
            self.add_target(&target)?;
        }

        if let Some(mode) = lookup(env::MODE) {
            self.scheduler.mode = mode
                .trim()
                .parse()
                .map_err(|e: String| ConfigError::Invalid(format!("{}: {}", env::MODE, e)))?;
        }

        Ok(())
    }

    /// Register a host device name as the default speaker model
    pub fn add_target(&mut self, name: &str) -> Result<()> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ConfigError::Invalid(
                "target device name is empty".to_string(),
            ));
        }
        if !self.devices.iter().any(|d| d.name.trim() == name) {
            self.devices.push(DeviceAlias {
                name: name.to_string(),
                model: DeviceModel::default(),
            });
        }
        Ok(())
    }

    /// Check everything needed to start; run once before the scheduler.
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.mode == CandidateMode::DefaultDevice && self.devices.is_empty() {
            return Err(ConfigError::Missing(format!(
                "target device (set {}, pass --target, or add a [[devices]] entry)",
                env::DEVICE_TARGET
            )));
        }

        self.registry().map(|_| ())
    }

    /// Build the read-only profile registry from built-ins, tuning and aliases
    pub fn registry(&self) -> Result<DeviceProfileRegistry> {
        let mut builder = RegistryBuilder::new();

        for (key, tuning) in &self.profiles {
            let model: DeviceModel = key
                .parse()
                .map_err(|e: String| ConfigError::Invalid(format!("[profiles.{}]: {}", key, e)))?;
            builder = builder.tune(model, tuning)?;
        }

        for alias in &self.devices {
            builder = builder.alias(&alias.name, alias.model)?;
        }

        Ok(builder.build())
    }

    pub fn scheduler_settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            mode: self.scheduler.mode,
            rescan_interval: match self.scheduler.rescan_interval_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            when_idle: self.scheduler.when_idle,
        }
    }
}

/// Locates and loads the main config file at `~/.config/insomnia/config.toml`
pub struct ConfigManager {
    config_dir: PathBuf,
    config_path: PathBuf,
}

impl ConfigManager {
    pub fn new(config_dir: PathBuf) -> Self {
        let config_path = config_dir.join("config.toml");
        Self {
            config_dir,
            config_path,
        }
    }

    /// Use an explicit file instead of the default location
    pub fn with_path(config_path: PathBuf) -> Self {
        let config_dir = config_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Self {
            config_dir,
            config_path,
        }
    }

    /// Get the default config directory path
    ///
    /// Returns `~/.config/insomnia` on Linux, `~/Library/Application Support/insomnia`
    /// on Mac and `%APPDATA%\insomnia` on Windows
    pub fn default_config_dir() -> Result<PathBuf> {
        dirs::config_dir()
            .map(|p| p.join("insomnia"))
            .ok_or_else(|| ConfigError::Invalid("Could not determine config directory".to_string()))
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn exists(&self) -> bool {
        self.config_path.exists()
    }

    /// Load configuration from file
    ///
    /// A missing file yields the defaults. A file that exists but does not
    /// parse is an error: running with settings the operator did not ask for
    /// is worse than not starting.
    #[instrument(skip(self))]
    pub async fn load(&self) -> Result<AppConfig> {
        if !self.exists() {
            info!(
                path = %self.config_path.display(),
                "Config file not found, using defaults"
            );
            return Ok(AppConfig::default());
        }

        AppConfig::load_from_file(&self.config_path).await
    }

    #[instrument(skip(self, config))]
    pub async fn save(&self, config: &AppConfig) -> Result<()> {
        fs::create_dir_all(&self.config_dir).await?;
        config.save_to_file(&self.config_path).await
    }
}
