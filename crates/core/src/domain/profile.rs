//! Known speaker models and their keep-alive profiles
//!
//! The registry is built once at startup and never mutated afterwards, so it
//! can be shared between device tasks behind an `Arc` without locking.

use crate::domain::tone::{FrequencyConfiguration, ToneError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, PartialEq)]
pub enum ProfileError {
    #[error("Interval must be a positive number of seconds up to {max}, got {0}", max = MAX_INTERVAL_SECS)]
    InvalidInterval(f64),

    #[error("Invalid tone for {model}: {source}")]
    InvalidTone {
        model: DeviceModel,
        #[source]
        source: ToneError,
    },

    #[error("Alias name cannot be empty")]
    EmptyAlias,
}

pub type Result<T> = std::result::Result<T, ProfileError>;

/// Longest accepted pause between playbacks (one day)
pub const MAX_INTERVAL_SECS: f64 = 86_400.0;

/// Speaker models with a known keep-alive profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DeviceModel {
    #[serde(rename = "jbl-charge-3")]
    JblCharge3,
}

impl DeviceModel {
    pub const ALL: &'static [DeviceModel] = &[DeviceModel::JblCharge3];

    /// Marketing name, also the name the speaker advertises over Bluetooth
    pub fn display_name(&self) -> &'static str {
        match self {
            DeviceModel::JblCharge3 => "JBL Charge 3",
        }
    }

    /// Key used in config files
    pub fn key(&self) -> &'static str {
        match self {
            DeviceModel::JblCharge3 => "jbl-charge-3",
        }
    }

    /// Exact, case-sensitive match on the display name
    pub fn from_display_name(name: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|model| model.display_name() == name)
    }

    /// Factory profile for this model
    pub fn builtin_configuration(&self) -> DeviceConfiguration {
        match self {
            // 10 Hz is below what the speaker reproduces audibly but still
            // registers as signal, which resets its auto-off timer.
            DeviceModel::JblCharge3 => DeviceConfiguration {
                model: *self,
                interval: Duration::from_secs(5),
                frequency_configuration: FrequencyConfiguration::new(10, 2.0, 44100, 0.005)
                    .expect("builtin tone parameters are valid"),
            },
        }
    }
}

impl Default for DeviceModel {
    fn default() -> Self {
        DeviceModel::JblCharge3
    }
}

impl std::str::FromStr for DeviceModel {
    type Err = String;

    /// Parse a config key such as `jbl-charge-3`
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|model| model.key() == s)
            .ok_or_else(|| format!("unknown device model '{}'", s))
    }
}

impl fmt::Display for DeviceModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Keep-alive profile for one speaker model
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeviceConfiguration {
    model: DeviceModel,
    /// Pause after a playback finishes before the next one starts
    interval: Duration,
    frequency_configuration: FrequencyConfiguration,
}

impl DeviceConfiguration {
    pub fn new(
        model: DeviceModel,
        interval: f64,
        frequency_configuration: FrequencyConfiguration,
    ) -> Result<Self> {
        if !(interval > 0.0 && interval <= MAX_INTERVAL_SECS) {
            return Err(ProfileError::InvalidInterval(interval));
        }
        let interval = Duration::try_from_secs_f64(interval)
            .map_err(|_| ProfileError::InvalidInterval(interval))?;
        Ok(Self {
            model,
            interval,
            frequency_configuration,
        })
    }

    pub fn model(&self) -> DeviceModel {
        self.model
    }

    pub fn interval_secs(&self) -> f64 {
        self.interval.as_secs_f64()
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn frequency_configuration(&self) -> &FrequencyConfiguration {
        &self.frequency_configuration
    }
}

/// Partial profile used to tune a built-in one from configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_secs: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency_hz: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amplitude: Option<f64>,
}

impl ProfileOverride {
    /// Merge this override on top of `base`, validating the result
    pub fn apply(&self, base: &DeviceConfiguration) -> Result<DeviceConfiguration> {
        let tone = base.frequency_configuration();
        let frequency_configuration = FrequencyConfiguration::new(
            self.frequency_hz.unwrap_or(tone.frequency()),
            self.duration_secs.unwrap_or(tone.duration()),
            self.sample_rate.unwrap_or(tone.sample_rate()),
            self.amplitude.unwrap_or(tone.amplitude()),
        )
        .map_err(|source| ProfileError::InvalidTone {
            model: base.model(),
            source,
        })?;

        DeviceConfiguration::new(
            base.model(),
            self.interval_secs.unwrap_or(base.interval_secs()),
            frequency_configuration,
        )
    }
}

/// Read-only lookup from device identity to keep-alive profile
#[derive(Debug, Clone)]
pub struct DeviceProfileRegistry {
    profiles: BTreeMap<DeviceModel, DeviceConfiguration>,
    aliases: HashMap<String, DeviceModel>,
}

impl Default for DeviceProfileRegistry {
    fn default() -> Self {
        RegistryBuilder::new().build()
    }
}

impl DeviceProfileRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    /// Resolve a host device name to its profile.
    ///
    /// The name is trimmed, then matched exactly against configured aliases
    /// and then against model display names. `None` is the common case: most
    /// output devices are not keep-alive targets.
    pub fn resolve(&self, identity: &str) -> Option<&DeviceConfiguration> {
        let identity = identity.trim();
        let model = self
            .aliases
            .get(identity)
            .copied()
            .or_else(|| DeviceModel::from_display_name(identity))?;
        self.profiles.get(&model)
    }

    pub fn resolve_model(&self, model: DeviceModel) -> Option<&DeviceConfiguration> {
        self.profiles.get(&model)
    }

    pub fn profiles(&self) -> impl Iterator<Item = &DeviceConfiguration> {
        self.profiles.values()
    }

    /// Configured aliases, sorted by name
    pub fn aliases(&self) -> Vec<(&str, DeviceModel)> {
        let mut aliases: Vec<_> = self
            .aliases
            .iter()
            .map(|(name, model)| (name.as_str(), *model))
            .collect();
        aliases.sort();
        aliases
    }
}

/// Assembles a [`DeviceProfileRegistry`] at startup
#[derive(Debug, Clone)]
pub struct RegistryBuilder {
    profiles: BTreeMap<DeviceModel, DeviceConfiguration>,
    aliases: HashMap<String, DeviceModel>,
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryBuilder {
    /// Start from the factory profiles of every known model
    pub fn new() -> Self {
        let profiles = DeviceModel::ALL
            .iter()
            .map(|model| (*model, model.builtin_configuration()))
            .collect();
        Self {
            profiles,
            aliases: HashMap::new(),
        }
    }

    /// Replace a model's profile wholesale
    pub fn profile(mut self, configuration: DeviceConfiguration) -> Self {
        self.profiles.insert(configuration.model(), configuration);
        self
    }

    /// Tune a model's profile with a partial override
    pub fn tune(mut self, model: DeviceModel, tuning: &ProfileOverride) -> Result<Self> {
        let base = self
            .profiles
            .get(&model)
            .copied()
            .unwrap_or_else(|| model.builtin_configuration());
        let tuned = tuning.apply(&base)?;
        debug!(model = %model, interval = tuned.interval_secs(), "Tuned device profile");
        self.profiles.insert(model, tuned);
        Ok(self)
    }

    /// Map a host device name onto a known model
    pub fn alias(mut self, name: &str, model: DeviceModel) -> Result<Self> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ProfileError::EmptyAlias);
        }
        self.aliases.insert(name.to_string(), model);
        Ok(self)
    }

    pub fn build(self) -> DeviceProfileRegistry {
        DeviceProfileRegistry {
            profiles: self.profiles,
            aliases: self.aliases,
        }
    }
}
