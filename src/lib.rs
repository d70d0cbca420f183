//! voice_loop - real-time voice conversation audio pipeline
//!
//! Streams microphone audio to a remote conversational endpoint and plays its
//! spoken replies back gaplessly, with barge-in and a strict teardown order.

pub mod audio;
pub mod config;
mod controller;
pub mod error;
pub mod lifecycle;
pub mod loopback;
pub mod protocol;
pub mod session;
pub mod state_machine;
pub mod stats;
#[cfg(test)]
mod testing;
pub mod transport;

#[cfg(feature = "alsa")]
pub use audio::AlsaBackend;
pub use audio::{AudioBackend, LevelMeter};
pub use config::Config;
pub use error::PipelineError;
pub use loopback::{LoopbackTransport, RemoteEnd};
pub use protocol::{EncodedFrame, ServerMessage, SessionConfig};
pub use session::VoiceSession;
pub use state_machine::SessionState;
pub use stats::StatsSnapshot;
pub use transport::{Transport, TransportEvent, TransportHandle, TransportSession};
