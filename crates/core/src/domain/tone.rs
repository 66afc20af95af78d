//! Keep-alive tone generation
//!
//! A keep-alive tone is a short, very quiet, very low sine wave. It is
//! rendered once per device and replayed every cycle.
//!
//! All samples are f32 normalized to [-1.0, 1.0].

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::sync::Arc;
use thiserror::Error;

/// Defaults used when a profile leaves a field out
pub mod defaults {
    pub const SAMPLE_RATE: u32 = 44100;
    pub const AMPLITUDE: f64 = 0.5;
}

/// Upper bounds for a keep-alive tone. Anything longer is a misconfiguration
/// and would only allocate a huge buffer.
pub mod limits {
    pub const MAX_DURATION_SECS: f64 = 10.0;
    pub const MAX_SAMPLE_RATE: u32 = 384_000;
}

/// Errors raised while validating or rendering a tone
#[derive(Debug, Error, PartialEq)]
pub enum ToneError {
    #[error("Frequency must be positive")]
    ZeroFrequency,

    #[error("Duration must be a positive number of seconds, got {0}")]
    InvalidDuration(f64),

    #[error("Duration of {0}s exceeds the {max}s limit", max = limits::MAX_DURATION_SECS)]
    DurationTooLong(f64),

    #[error("Sample rate must be positive")]
    ZeroSampleRate,

    #[error("Sample rate {0} Hz exceeds the {max} Hz limit", max = limits::MAX_SAMPLE_RATE)]
    SampleRateTooHigh(u32),

    #[error("Amplitude must be within [0, 1], got {0}")]
    InvalidAmplitude(f64),

    #[error("{sample_rate} Hz over {duration}s yields no samples")]
    EmptyWaveform { sample_rate: u32, duration: f64 },
}

pub type Result<T> = std::result::Result<T, ToneError>;

/// Number of samples a tone of `duration` seconds occupies at `sample_rate`
fn sample_count(sample_rate: u32, duration: f64) -> usize {
    (sample_rate as f64 * duration).floor() as usize
}

fn validate(frequency: u32, duration: f64, sample_rate: u32, amplitude: f64) -> Result<()> {
    if frequency == 0 {
        return Err(ToneError::ZeroFrequency);
    }
    if !duration.is_finite() || duration <= 0.0 {
        return Err(ToneError::InvalidDuration(duration));
    }
    if duration > limits::MAX_DURATION_SECS {
        return Err(ToneError::DurationTooLong(duration));
    }
    if sample_rate == 0 {
        return Err(ToneError::ZeroSampleRate);
    }
    if sample_rate > limits::MAX_SAMPLE_RATE {
        return Err(ToneError::SampleRateTooHigh(sample_rate));
    }
    if !(0.0..=1.0).contains(&amplitude) {
        return Err(ToneError::InvalidAmplitude(amplitude));
    }
    if sample_count(sample_rate, duration) == 0 {
        return Err(ToneError::EmptyWaveform {
            sample_rate,
            duration,
        });
    }
    Ok(())
}

fn sine(frequency: u32, sample_rate: u32, amplitude: f64, count: usize) -> impl Iterator<Item = f32> {
    let step = 2.0 * PI * frequency as f64 / sample_rate as f64;
    (0..count).map(move |i| (amplitude * (step * i as f64).sin()) as f32)
}

/// Sample a sine wave.
///
/// Produces `floor(sample_rate * duration)` samples where sample `i` is
/// `amplitude * sin(2π * frequency * i / sample_rate)`.
///
/// # Errors
/// Any parameter [`FrequencyConfiguration::new`] would reject.
pub fn generate(frequency: u32, duration: f64, sample_rate: u32, amplitude: f64) -> Result<Vec<f32>> {
    validate(frequency, duration, sample_rate, amplitude)?;

    let count = sample_count(sample_rate, duration);
    Ok(sine(frequency, sample_rate, amplitude, count).collect())
}

/// Validated tone parameters
///
/// Fields are private so a value can only exist once it has passed
/// validation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawFrequencyConfiguration", into = "RawFrequencyConfiguration")]
pub struct FrequencyConfiguration {
    frequency: u32,
    duration: f64,
    sample_rate: u32,
    amplitude: f64,
}

impl FrequencyConfiguration {
    pub fn new(frequency: u32, duration: f64, sample_rate: u32, amplitude: f64) -> Result<Self> {
        validate(frequency, duration, sample_rate, amplitude)?;
        Ok(Self {
            frequency,
            duration,
            sample_rate,
            amplitude,
        })
    }

    /// Same tone, re-targeted at another sample rate
    pub fn with_sample_rate(&self, sample_rate: u32) -> Result<Self> {
        Self::new(self.frequency, self.duration, sample_rate, self.amplitude)
    }

    pub fn frequency(&self) -> u32 {
        self.frequency
    }

    pub fn duration(&self) -> f64 {
        self.duration
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn amplitude(&self) -> f64 {
        self.amplitude
    }

    pub fn sample_count(&self) -> usize {
        sample_count(self.sample_rate, self.duration)
    }

    /// Render the waveform once so it can be replayed every cycle
    #[must_use]
    pub fn render(&self) -> Tone {
        let samples: Arc<[f32]> = sine(
            self.frequency,
            self.sample_rate,
            self.amplitude,
            self.sample_count(),
        )
        .collect();

        Tone {
            samples,
            sample_rate: self.sample_rate,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct RawFrequencyConfiguration {
    frequency: u32,
    duration: f64,
    #[serde(default = "default_sample_rate")]
    sample_rate: u32,
    #[serde(default = "default_amplitude")]
    amplitude: f64,
}

fn default_sample_rate() -> u32 {
    defaults::SAMPLE_RATE
}

fn default_amplitude() -> f64 {
    defaults::AMPLITUDE
}

impl TryFrom<RawFrequencyConfiguration> for FrequencyConfiguration {
    type Error = ToneError;

    fn try_from(raw: RawFrequencyConfiguration) -> Result<Self> {
        Self::new(raw.frequency, raw.duration, raw.sample_rate, raw.amplitude)
    }
}

impl From<FrequencyConfiguration> for RawFrequencyConfiguration {
    fn from(config: FrequencyConfiguration) -> Self {
        Self {
            frequency: config.frequency,
            duration: config.duration,
            sample_rate: config.sample_rate,
            amplitude: config.amplitude,
        }
    }
}

/// A rendered waveform, cheap to clone and share with playback threads
#[derive(Debug, Clone)]
pub struct Tone {
    samples: Arc<[f32]>,
    sample_rate: u32,
}

impl Tone {
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }
}
