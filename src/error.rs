//! Error taxonomy for the voice pipeline.

use crate::state_machine::SessionState;

/// Everything that can go wrong during a call.
///
/// Fatal variants end the session in `Error` with full teardown; the
/// rest are dropped-and-logged by the component that hit them.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PipelineError {
    #[error("microphone access denied: {0}")]
    PermissionDenied(String),
    #[error("audio device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("failed to open transport: {0}")]
    TransportOpen(String),
    #[error("transport error: {0}")]
    TransportRuntime(String),
    #[error("failed to decode audio chunk: {0}")]
    Decode(String),
    #[error("failed to schedule audio chunk: {0}")]
    Schedule(String),
    #[error("no transition from {from} on {trigger}")]
    InvalidTransition {
        from: SessionState,
        trigger: &'static str,
    },
    #[error("session already started")]
    AlreadyStarted,
}

impl PipelineError {
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PipelineError::PermissionDenied(_)
                | PipelineError::DeviceUnavailable(_)
                | PipelineError::TransportOpen(_)
                | PipelineError::TransportRuntime(_)
        )
    }
}
