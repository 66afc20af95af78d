//! Per-device keep-alive cycle
//!
//! Each matched speaker gets its own [`DeviceTask`] holding its profile,
//! pre-rendered tone and stop signal. Tasks share nothing mutable; the
//! current [`CycleState`] is published on a watch channel.

use super::KeepAliveError;
use crate::domain::audio::{play_block, AudioSink, DeviceInfo, SampleRate, StreamRequest};
use crate::domain::profile::{DeviceConfiguration, DeviceModel};
use crate::domain::tone::Tone;
use crate::domain::DeviceId;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Where a device task is in its cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    Idle,
    Playing,
    Sleeping,
}

/// What one device task did before it stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceReport {
    pub device: DeviceId,
    pub model: DeviceModel,
    pub cycles: u64,
    pub failures: u64,
}

/// Keep-alive loop for a single output device
pub struct DeviceTask {
    device: DeviceInfo,
    configuration: DeviceConfiguration,
    tone: Tone,
    sink: Arc<dyn AudioSink>,
    stop: watch::Receiver<bool>,
    state: watch::Sender<CycleState>,
    cycles: u64,
    failures: u64,
}

impl DeviceTask {
    /// Prepare a task and render its tone.
    ///
    /// The tone is rendered at the device's own default rate when it reports
    /// one, so the host does not have to resample; otherwise the profile's
    /// rate is used.
    pub fn new(
        device: DeviceInfo,
        configuration: DeviceConfiguration,
        sink: Arc<dyn AudioSink>,
        stop: watch::Receiver<bool>,
    ) -> Self {
        let profile_tone = *configuration.frequency_configuration();
        let frequency_configuration = match device.default_sample_rate {
            Some(rate) if rate.hz() != profile_tone.sample_rate() => {
                match profile_tone.with_sample_rate(rate.hz()) {
                    Ok(retargeted) => retargeted,
                    Err(e) => {
                        warn!(
                            device = %device.id,
                            rate = rate.hz(),
                            error = %e,
                            "Device sample rate unusable, keeping profile rate"
                        );
                        profile_tone
                    }
                }
            }
            _ => profile_tone,
        };

        let (state, _) = watch::channel(CycleState::Idle);

        Self {
            tone: frequency_configuration.render(),
            device,
            configuration,
            sink,
            stop,
            state,
            cycles: 0,
            failures: 0,
        }
    }

    pub fn device(&self) -> &DeviceInfo {
        &self.device
    }

    pub fn configuration(&self) -> &DeviceConfiguration {
        &self.configuration
    }

    pub fn tone(&self) -> &Tone {
        &self.tone
    }

    pub fn state(&self) -> CycleState {
        *self.state.borrow()
    }

    /// Follow the task's state while it runs
    pub fn subscribe(&self) -> watch::Receiver<CycleState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: CycleState) {
        self.state.send_replace(state);
    }

    fn stop_requested(&self) -> bool {
        *self.stop.borrow()
    }

    fn request(&self) -> StreamRequest {
        StreamRequest::mono(
            SampleRate::from_hz(self.tone.sample_rate()),
            Some(self.device.id.clone()),
        )
    }

    /// Play the tone once.
    ///
    /// Playback blocks for the tone's duration, so it runs on the blocking
    /// pool; the stream is opened, written and closed on that one thread.
    /// A panic in the sink is resumed on this task.
    pub async fn play_once(&mut self) -> Result<(), KeepAliveError> {
        self.set_state(CycleState::Playing);

        let sink = Arc::clone(&self.sink);
        let tone = self.tone.clone();
        let request = self.request();

        let result =
            tokio::task::spawn_blocking(move || play_block(sink.as_ref(), &request, tone.samples()))
                .await;

        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(source)) => Err(KeepAliveError::Playback {
                device: self.device.id.clone(),
                source,
            }),
            Err(join) if join.is_panic() => std::panic::resume_unwind(join.into_panic()),
            Err(_) => Err(KeepAliveError::Interrupted),
        }
    }

    /// Run play/sleep cycles until the stop signal fires.
    ///
    /// A failed playback is logged and the next attempt happens on the normal
    /// schedule. The stop signal is honoured during the sleep, never in the
    /// middle of a playback.
    pub async fn run(mut self) -> DeviceReport {
        let interval = self.configuration.interval();
        let frequency = self.configuration.frequency_configuration().frequency();

        info!(
            model = %self.configuration.model(),
            frequency,
            interval_secs = self.configuration.interval_secs(),
            sample_rate = self.tone.sample_rate(),
            "Keep-alive started"
        );

        loop {
            if self.stop_requested() {
                break;
            }

            match self.play_once().await {
                Ok(()) => {
                    self.cycles += 1;
                    info!(frequency, "Played keep-alive tone");
                }
                Err(KeepAliveError::Interrupted) => break,
                Err(e) => {
                    self.failures += 1;
                    warn!(error = %e, failures = self.failures, "Keep-alive playback failed");
                }
            }

            self.set_state(CycleState::Sleeping);
            debug!(interval_secs = self.configuration.interval_secs(), "Sleeping");

            let sender_gone = tokio::select! {
                _ = tokio::time::sleep(interval) => false,
                changed = self.stop.changed() => changed.is_err(),
            };
            if sender_gone {
                break;
            }
        }

        self.set_state(CycleState::Idle);
        info!(cycles = self.cycles, failures = self.failures, "Keep-alive stopped");

        DeviceReport {
            device: self.device.id.clone(),
            model: self.configuration.model(),
            cycles: self.cycles,
            failures: self.failures,
        }
    }
}
