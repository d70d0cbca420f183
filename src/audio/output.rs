use async_trait::async_trait;
use tokio::sync::mpsc;

use super::capture::{CaptureConstraints, MicrophoneStream};
use super::pcm::PlaybackChunk;
use crate::error::PipelineError;

/// Identifies one scheduled chunk on an output device.
pub type ChunkId = u64;

/// An output audio context with its own monotonic clock.
///
/// Chunks are started at absolute clock times; when one finishes playing
/// naturally its id is sent on the `ended` channel given at open time.
/// Stopped chunks produce no notification.
pub trait OutputDevice: Send {
    /// Current output-clock time in seconds.
    fn now(&self) -> f64;

    /// Places the chunk at `at`, or at the current clock if `at` has already
    /// passed. Returns the clock time the chunk actually starts at; reading the
    /// clock and placing happen atomically with respect to the render side.
    fn start(&mut self, id: ChunkId, chunk: PlaybackChunk, at: f64) -> Result<f64, PipelineError>;

    fn stop(&mut self, id: ChunkId);

    fn close(&mut self) -> anyhow::Result<()>;

    fn is_closed(&self) -> bool;
}

/// Where microphones and output contexts come from.
#[async_trait]
pub trait AudioBackend: Send + Sync {
    /// May be refused (`PermissionDenied`) or fail (`DeviceUnavailable`).
    async fn open_microphone(
        &self,
        constraints: &CaptureConstraints,
    ) -> Result<Box<dyn MicrophoneStream>, PipelineError>;

    fn open_output(
        &self,
        sample_rate: u32,
        ended: mpsc::UnboundedSender<ChunkId>,
    ) -> Result<Box<dyn OutputDevice>, PipelineError>;
}
