//! audio - microphone capture, level metering and scheduled playback
//!
//! Device access sits behind [`output::AudioBackend`]; the ALSA implementation
//! is compiled with the `alsa` feature.

#[cfg(feature = "alsa")]
mod alsa_backend;
#[cfg(feature = "alsa")]
mod alsa_device;
pub mod capture;
pub mod meter;
pub mod mixer;
pub mod output;
pub mod pcm;
pub mod resample;
pub mod scheduler;

#[cfg(feature = "alsa")]
pub use alsa_backend::AlsaBackend;
pub use capture::{CaptureConstraints, CaptureSink, CaptureUnit, MicrophoneStream};
pub use meter::LevelMeter;
pub use mixer::MixerOutput;
pub use output::{AudioBackend, ChunkId, OutputDevice};
pub use pcm::{AudioFrame, PlaybackChunk};
pub use scheduler::{OutputScheduler, ScheduledSpan};
