//! Keep-alive scheduling
//!
//! The [`KeepAliveScheduler`] periodically enumerates output devices,
//! resolves each against the [`DeviceProfileRegistry`] and keeps one
//! [`DeviceTask`] running per matched device. Tasks are independent tokio
//! tasks, so one speaker's sleep never delays another's playback.
//!
//! Matching is re-evaluated on every enumeration pass. In default-device
//! mode this is also how a change of the host's default output is noticed:
//! only at the next pass, never in between.

mod task;

pub use task::{CycleState, DeviceReport, DeviceTask};

use crate::domain::audio::{AudioEnumerator, AudioError, AudioSink, DeviceId, DeviceInfo};
use crate::domain::config::ConfigError;
use crate::domain::profile::{DeviceConfiguration, DeviceModel, DeviceProfileRegistry};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Errors surfaced by the keep-alive machinery
///
/// Only the fatal kinds (`ConfigurationMissing`, `AudioSubsystemInit`,
/// `Config`) ever leave [`KeepAliveScheduler::run`]; the rest are handled
/// per device and logged.
#[derive(Debug, Error)]
pub enum KeepAliveError {
    #[error("Configuration missing: {0}")]
    ConfigurationMissing(String),

    #[error("No device profile for '{0}'")]
    DeviceProfileNotFound(String),

    #[error("Audio subsystem failed to initialise: {0}")]
    AudioSubsystemInit(#[source] AudioError),

    #[error("Playback failed on '{device}': {source}")]
    Playback {
        device: DeviceId,
        #[source]
        source: AudioError,
    },

    #[error("Interrupted by operator")]
    Interrupted,

    #[error(transparent)]
    Config(ConfigError),
}

impl From<ConfigError> for KeepAliveError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::Missing(what) => KeepAliveError::ConfigurationMissing(what),
            other => KeepAliveError::Config(other),
        }
    }
}

impl KeepAliveError {
    /// Process exit code for this error reaching `main`
    pub fn exit_code(&self) -> i32 {
        match self {
            KeepAliveError::Interrupted => 0,
            _ => 1,
        }
    }
}

/// Which devices are considered on each pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CandidateMode {
    /// Only whatever the host currently routes output to
    #[default]
    DefaultDevice,
    /// Every output device the host lists
    AllDevices,
}

impl FromStr for CandidateMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "default-device" => Ok(CandidateMode::DefaultDevice),
            "all-devices" => Ok(CandidateMode::AllDevices),
            other => Err(format!(
                "unknown mode '{}' (expected default-device or all-devices)",
                other
            )),
        }
    }
}

/// What to do when a pass matches no device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IdleBehavior {
    /// Stay up and keep rescanning
    #[default]
    Wait,
    /// Return cleanly
    Exit,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerSettings {
    pub mode: CandidateMode,
    /// `None` matches once at startup and never rescans
    pub rescan_interval: Option<Duration>,
    pub when_idle: IdleBehavior,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            mode: CandidateMode::DefaultDevice,
            rescan_interval: Some(Duration::from_secs(30)),
            when_idle: IdleBehavior::Wait,
        }
    }
}

/// Why the scheduler returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Interrupted,
    Idle,
}

#[derive(Debug, Clone)]
pub struct SchedulerReport {
    pub stop_reason: StopReason,
    pub devices: Vec<DeviceReport>,
}

impl SchedulerReport {
    pub fn total_cycles(&self) -> u64 {
        self.devices.iter().map(|d| d.cycles).sum()
    }

    pub fn total_failures(&self) -> u64 {
        self.devices.iter().map(|d| d.failures).sum()
    }
}

struct RunningTask {
    model: DeviceModel,
    stop: watch::Sender<bool>,
    state: watch::Receiver<CycleState>,
    handle: JoinHandle<DeviceReport>,
}

fn list_candidates(
    enumerator: &dyn AudioEnumerator,
    mode: CandidateMode,
) -> Result<Vec<DeviceInfo>, AudioError> {
    let devices = match mode {
        CandidateMode::DefaultDevice => vec![enumerator.default_output_device()?],
        CandidateMode::AllDevices => enumerator.output_devices()?,
    };

    Ok(devices.into_iter().filter(DeviceInfo::is_output).collect())
}

/// Drives keep-alive cycles for every matched device
pub struct KeepAliveScheduler {
    enumerator: Arc<dyn AudioEnumerator>,
    sink: Arc<dyn AudioSink>,
    registry: Arc<DeviceProfileRegistry>,
    settings: SchedulerSettings,
    tasks: BTreeMap<DeviceId, RunningTask>,
    finished: Vec<DeviceReport>,
}

impl KeepAliveScheduler {
    pub fn new(
        enumerator: Arc<dyn AudioEnumerator>,
        sink: Arc<dyn AudioSink>,
        registry: Arc<DeviceProfileRegistry>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            enumerator,
            sink,
            registry,
            settings,
            tasks: BTreeMap::new(),
            finished: Vec::new(),
        }
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    /// Devices currently being kept awake
    pub fn active_devices(&self) -> Vec<DeviceId> {
        self.tasks.keys().cloned().collect()
    }

    /// Output devices to consider this pass
    pub fn candidates(&self) -> Result<Vec<DeviceInfo>, AudioError> {
        list_candidates(self.enumerator.as_ref(), self.settings.mode)
    }

    /// [`Self::candidates`] off the async workers; host enumeration can block
    async fn enumerate(&self) -> Result<Vec<DeviceInfo>, AudioError> {
        let enumerator = Arc::clone(&self.enumerator);
        let mode = self.settings.mode;

        tokio::task::spawn_blocking(move || list_candidates(enumerator.as_ref(), mode))
            .await
            .map_err(|e| AudioError::HostUnavailable(format!("enumeration task failed: {}", e)))?
    }

    /// Look up one device's profile
    pub fn lookup(&self, device: &DeviceInfo) -> Result<&DeviceConfiguration, KeepAliveError> {
        self.registry
            .resolve(device.id.as_str())
            .ok_or_else(|| KeepAliveError::DeviceProfileNotFound(device.id.to_string()))
    }

    /// Keep only the candidates with a profile. Unknown devices are dropped
    /// quietly; duplicates of a name keep their first entry.
    pub fn resolve_active(
        &self,
        candidates: Vec<DeviceInfo>,
    ) -> BTreeMap<DeviceId, (DeviceInfo, DeviceConfiguration)> {
        let mut matched = BTreeMap::new();

        for device in candidates {
            match self.lookup(&device) {
                Ok(configuration) => {
                    let configuration = *configuration;
                    matched
                        .entry(device.id.clone())
                        .or_insert((device, configuration));
                }
                Err(e) => debug!(index = device.index, "{}", e),
            }
        }

        matched
    }

    /// One enumeration pass: start tasks for new matches, stop tasks whose
    /// device went away.
    async fn reconcile(&mut self, first_pass: bool) -> Result<(), KeepAliveError> {
        self.reap_finished().await;

        let candidates = match self.enumerate().await {
            Ok(candidates) => candidates,
            Err(AudioError::DeviceNotFound(reason)) => {
                info!(%reason, "No output device available");
                Vec::new()
            }
            Err(e) if first_pass => return Err(KeepAliveError::AudioSubsystemInit(e)),
            Err(e) => {
                warn!(error = %e, "Device enumeration failed, keeping current devices");
                return Ok(());
            }
        };

        let matched = self.resolve_active(candidates);

        let gone: Vec<DeviceId> = self
            .tasks
            .keys()
            .filter(|id| !matched.contains_key(*id))
            .cloned()
            .collect();
        for id in gone {
            info!(device = %id, "Device no longer active");
            self.stop_task(&id).await;
        }

        for (id, (device, configuration)) in matched {
            if let Some(running) = self.tasks.get(&id) {
                let state = *running.state.borrow();
                debug!(device = %id, ?state, "Device still active");
                continue;
            }
            info!(device = %id, model = %configuration.model(), "Matched keep-alive target");
            self.spawn_task(device, configuration);
        }

        Ok(())
    }

    /// Collect tasks that ended on their own (a panic in playback). Their
    /// device is picked up again by the matching that follows.
    async fn reap_finished(&mut self) {
        let dead: Vec<DeviceId> = self
            .tasks
            .iter()
            .filter(|(_, running)| running.handle.is_finished())
            .map(|(id, _)| id.clone())
            .collect();

        for id in dead {
            if let Some(running) = self.tasks.remove(&id) {
                warn!(device = %id, "Device task exited unexpectedly, restarting if still present");
                self.finished.push(Self::join(&id, running).await);
            }
        }
    }

    fn spawn_task(&mut self, device: DeviceInfo, configuration: DeviceConfiguration) {
        let (stop, stop_rx) = watch::channel(false);
        let id = device.id.clone();
        let span = info_span!("device", name = %id);
        let task = DeviceTask::new(device, configuration, Arc::clone(&self.sink), stop_rx);
        let state = task.subscribe();

        let handle = tokio::spawn(task.run().instrument(span));
        self.tasks.insert(
            id,
            RunningTask {
                model: configuration.model(),
                stop,
                state,
                handle,
            },
        );
    }

    async fn stop_task(&mut self, id: &DeviceId) {
        if let Some(running) = self.tasks.remove(id) {
            let state = *running.state.borrow();
            debug!(device = %id, ?state, "Stopping device task");
            let _ = running.stop.send(true);
            self.finished.push(Self::join(id, running).await);
        }
    }

    async fn join(id: &DeviceId, running: RunningTask) -> DeviceReport {
        match running.handle.await {
            Ok(report) => report,
            Err(e) => {
                error!(device = %id, error = %e, "Device task ended abnormally");
                DeviceReport {
                    device: id.clone(),
                    model: running.model,
                    cycles: 0,
                    failures: 0,
                }
            }
        }
    }

    /// Signal every task, then wait for each to finish its current playback
    /// (which closes its stream) and exit.
    async fn stop_all(&mut self) {
        let tasks = std::mem::take(&mut self.tasks);
        for running in tasks.values() {
            let _ = running.stop.send(true);
        }
        for (id, running) in tasks {
            self.finished.push(Self::join(&id, running).await);
        }
    }

    /// Run until `shutdown` flips to `true` (or its sender is dropped), or
    /// until idle when configured to exit on idle.
    ///
    /// # Errors
    /// [`KeepAliveError::AudioSubsystemInit`] if the very first enumeration
    /// fails. Everything after startup is logged and survived.
    pub async fn run(
        mut self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<SchedulerReport, KeepAliveError> {
        info!(
            mode = ?self.settings.mode,
            rescan_interval = ?self.settings.rescan_interval,
            "Keep-alive scheduler starting"
        );

        let rescan_interval = self.settings.rescan_interval;
        let mut first_pass = true;

        let stop_reason = loop {
            if *shutdown.borrow() {
                break StopReason::Interrupted;
            }

            if let Err(e) = self.reconcile(first_pass).await {
                self.stop_all().await;
                return Err(e);
            }
            first_pass = false;

            if self.tasks.is_empty() {
                match self.settings.when_idle {
                    IdleBehavior::Exit => {
                        info!("No keep-alive targets, exiting");
                        break StopReason::Idle;
                    }
                    IdleBehavior::Wait => debug!("No keep-alive targets, waiting"),
                }
            }

            let next_pass = async move {
                match rescan_interval {
                    Some(interval) => tokio::time::sleep(interval).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = next_pass => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break StopReason::Interrupted;
                    }
                }
            }
        };

        self.stop_all().await;
        info!(reason = ?stop_reason, "Keep-alive scheduler stopped");

        Ok(SchedulerReport {
            stop_reason,
            devices: std::mem::take(&mut self.finished),
        })
    }
}
