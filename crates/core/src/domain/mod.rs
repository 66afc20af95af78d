//! Domain entities and business rules

pub mod audio;
pub mod config;
pub mod profile;
pub mod scheduler;
pub mod tone;

// Re-export specific items to avoid ambiguous glob imports
pub use audio::{
    play_block, AudioEnumerator, AudioError, AudioSink, ChannelCount, DeviceId, DeviceInfo,
    OutputStream, SampleRate, StreamRequest,
};
pub use config::{AppConfig, ConfigError, ConfigManager, DeviceAlias};
pub use profile::{
    DeviceConfiguration, DeviceModel, DeviceProfileRegistry, ProfileError, ProfileOverride,
    RegistryBuilder,
};
pub use scheduler::{
    CandidateMode, CycleState, DeviceReport, DeviceTask, IdleBehavior, KeepAliveError,
    KeepAliveScheduler, SchedulerReport, SchedulerSettings, StopReason,
};
pub use tone::{generate, FrequencyConfiguration, Tone, ToneError};
