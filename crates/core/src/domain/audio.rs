//! Audio device abstractions and domain models
//!
//! This module defines the audio collaborators the keep-alive logic talks to.
//! Implementations for real hosts (WASAPI, ALSA, CoreAudio via cpal) live in
//! the `infra` crate; tests plug in fakes.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur in the audio subsystem
#[derive(Debug, Error)]
pub enum AudioError {
    /// Requested audio device was not found
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Error in audio stream creation or playback
    #[error("Stream error: {0}")]
    StreamError(String),

    /// Invalid configuration for audio device
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Input/Output error at the OS level
    #[error("OS error: {0}")]
    OsError(String),

    /// Device does not support the requested configuration
    #[error("Unsupported configuration: {0}")]
    UnsupportedConfiguration(String),

    /// The host audio layer could not be initialised at all
    #[error("Audio host unavailable: {0}")]
    HostUnavailable(String),
}

pub type Result<T> = std::result::Result<T, AudioError>;

/// Identifier for an audio device
///
/// Hosts may renumber devices between enumerations, so the trimmed device
/// name is the only identity we carry across passes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into().trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Audio sample rate in Hz
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleRate {
    Hz44100,
    Hz48000,
    Hz96000,
    Hz192000,
    Custom(u32),
}

impl SampleRate {
    pub fn hz(&self) -> u32 {
        match self {
            SampleRate::Hz44100 => 44100,
            SampleRate::Hz48000 => 48000,
            SampleRate::Hz96000 => 96000,
            SampleRate::Hz192000 => 192000,
            SampleRate::Custom(hz) => *hz,
        }
    }

    pub fn from_hz(hz: u32) -> Self {
        match hz {
            44100 => SampleRate::Hz44100,
            48000 => SampleRate::Hz48000,
            96000 => SampleRate::Hz96000,
            192000 => SampleRate::Hz192000,
            hz => SampleRate::Custom(hz),
        }
    }
}

/// Number of audio channels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelCount {
    Mono,
    Stereo,
    Surround(u16),
}

impl ChannelCount {
    pub fn count(&self) -> u16 {
        match self {
            ChannelCount::Mono => 1,
            ChannelCount::Stereo => 2,
            ChannelCount::Surround(n) => *n,
        }
    }
}

/// Snapshot of one host audio device, as reported by a single enumeration pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Position in the host's device list for this pass only
    pub index: usize,
    pub id: DeviceId,
    pub name: String,
    pub max_input_channels: u16,
    pub max_output_channels: u16,
    pub default_sample_rate: Option<SampleRate>,
    pub default_low_output_latency: Option<Duration>,
    pub default_high_output_latency: Option<Duration>,
}

impl DeviceInfo {
    /// Minimal descriptor for an output-only device
    pub fn output(index: usize, name: impl Into<String>, channels: u16, rate: SampleRate) -> Self {
        let name = name.into().trim().to_string();
        Self {
            index,
            id: DeviceId::new(name.clone()),
            name,
            max_input_channels: 0,
            max_output_channels: channels,
            default_sample_rate: Some(rate),
            default_low_output_latency: None,
            default_high_output_latency: None,
        }
    }

    /// Input-only devices (microphones) report zero output channels
    pub fn is_output(&self) -> bool {
        self.max_output_channels > 0
    }
}

/// Trait for enumerating host output devices
pub trait AudioEnumerator: Send + Sync {
    /// List every device that can play audio
    fn output_devices(&self) -> Result<Vec<DeviceInfo>>;

    /// Get the device the host currently routes output to
    fn default_output_device(&self) -> Result<DeviceInfo>;
}

/// Parameters for opening a playback stream
#[derive(Debug, Clone, PartialEq)]
pub struct StreamRequest {
    pub sample_rate: SampleRate,
    pub channels: ChannelCount,
    /// `None` plays on whatever the host default is at open time
    pub device: Option<DeviceId>,
}

impl StreamRequest {
    pub fn mono(sample_rate: SampleRate, device: Option<DeviceId>) -> Self {
        Self {
            sample_rate,
            channels: ChannelCount::Mono,
            device,
        }
    }
}

/// An open playback stream
///
/// Implementations release the underlying device handle on `close` and
/// again in `Drop`, so dropping a stream after a failed write is enough to
/// free it. Streams are not required to be `Send`: they are opened, written
/// and closed on one thread.
pub trait OutputStream {
    /// Write one contiguous block of samples in [-1.0, 1.0].
    ///
    /// Blocks until the block has been handed to the device.
    fn write(&mut self, samples: &[f32]) -> Result<()>;

    /// Stop the stream and release the device. Idempotent.
    fn close(&mut self) -> Result<()>;
}

/// Opens playback streams on host devices
pub trait AudioSink: Send + Sync {
    fn open(&self, request: &StreamRequest) -> Result<Box<dyn OutputStream>>;
}

/// Play a block of samples: open, write, close.
///
/// If the write fails the stream is dropped on the way out, which releases
/// the device before the error is returned.
pub fn play_block(sink: &dyn AudioSink, request: &StreamRequest, samples: &[f32]) -> Result<()> {
    let mut stream = sink.open(request)?;
    stream.write(samples)?;
    stream.close()
}
