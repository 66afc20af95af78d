//! CPAL-based device enumeration
//!
//! Provides the host's output devices as [`DeviceInfo`] snapshots.

use cpal::traits::{DeviceTrait, HostTrait};
use insomnia_core::domain::audio::{
    AudioEnumerator, AudioError, DeviceId, DeviceInfo, Result, SampleRate,
};
use std::time::Duration;
use tracing::{debug, info};

/// Describe one cpal device
///
/// Channel counts are the maxima over the supported configurations, so an
/// input-only device reports zero output channels. Latencies are estimated
/// from the default config's buffer size range.
pub(crate) fn describe(index: usize, device: &cpal::Device) -> DeviceInfo {
    #[allow(deprecated)]
    let name = device
        .name()
        .map(|n| n.trim().to_string())
        .unwrap_or_else(|_| "Unknown Device".to_string());

    let max_output_channels = device
        .supported_output_configs()
        .map(|configs| configs.map(|c| c.channels()).max().unwrap_or(0))
        .unwrap_or(0);

    let max_input_channels = device
        .supported_input_configs()
        .map(|configs| configs.map(|c| c.channels()).max().unwrap_or(0))
        .unwrap_or(0);

    let default_config = device.default_output_config().ok();

    let default_sample_rate = default_config
        .as_ref()
        .map(|config| SampleRate::from_hz(config.sample_rate()));

    let (default_low_output_latency, default_high_output_latency) = match &default_config {
        Some(config) if config.sample_rate() > 0 => match config.buffer_size() {
            cpal::SupportedBufferSize::Range { min, max } => {
                let rate = config.sample_rate() as f64;
                (
                    Some(Duration::from_secs_f64(*min as f64 / rate)),
                    Some(Duration::from_secs_f64(*max as f64 / rate)),
                )
            }
            cpal::SupportedBufferSize::Unknown => (None, None),
        },
        _ => (None, None),
    };

    debug!(
        index,
        name = %name,
        max_output_channels,
        "Described device"
    );

    DeviceInfo {
        index,
        id: DeviceId::new(name.clone()),
        name,
        max_input_channels,
        max_output_channels,
        default_sample_rate,
        default_low_output_latency,
        default_high_output_latency,
    }
}

/// CPAL-based audio enumerator
pub struct CpalEnumerator {
    host: cpal::Host,
}

impl Default for CpalEnumerator {
    fn default() -> Self {
        info!("Initializing CPAL enumerator");
        Self::new()
    }
}

impl CpalEnumerator {
    pub fn new() -> Self {
        let host = cpal::default_host();
        debug!("Using audio host: {:?}", host.id());
        Self { host }
    }

    pub fn host_name(&self) -> &'static str {
        self.host.id().name()
    }
}

impl AudioEnumerator for CpalEnumerator {
    fn output_devices(&self) -> Result<Vec<DeviceInfo>> {
        debug!("Enumerating output devices");

        let devices: Vec<DeviceInfo> = self
            .host
            .output_devices()
            .map_err(|e| AudioError::HostUnavailable(e.to_string()))?
            .enumerate()
            .map(|(index, device)| describe(index, &device))
            .filter(DeviceInfo::is_output)
            .collect();

        debug!("Found {} output devices", devices.len());
        Ok(devices)
    }

    fn default_output_device(&self) -> Result<DeviceInfo> {
        let cpal_device = self
            .host
            .default_output_device()
            .ok_or_else(|| AudioError::DeviceNotFound("No default output device".to_string()))?;

        let mut info = describe(0, &cpal_device);

        // Report the default's position in the full listing, as a listing
        // would show it
        if let Ok(devices) = self.output_devices() {
            if let Some(listed) = devices.iter().find(|d| d.id == info.id) {
                info.index = listed.index;
            }
        }

        Ok(info)
    }
}
