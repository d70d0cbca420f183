//! Input capture unit: microphone blocks in, encoded PCM16 frames out.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use super::meter::LevelMeter;
use super::output::AudioBackend;
use super::pcm::AudioFrame;
use crate::error::PipelineError;
use crate::stats::SessionStats;
use crate::transport::TransportHandle;

/// Microphone request. Echo cancellation and noise suppression are hints
/// passed through to the device; nothing here implements them.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureConstraints {
    pub sample_rate: u32,
    /// Samples per callback block.
    pub block_size: usize,
    pub channels: u32,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
}

impl CaptureConstraints {
    /// Seconds per block.
    pub fn block_duration(&self) -> f64 {
        self.block_size as f64 / self.sample_rate as f64
    }
}

/// An acquired microphone.
///
/// `connect` installs the processing callback: from then on the device calls
/// [`CaptureSink::process_block`] from its own thread with `block_size`
/// normalized mono samples per tick.
pub trait MicrophoneStream: Send {
    fn connect(&mut self, sink: CaptureSink) -> anyhow::Result<()>;

    /// Detaches the processing callback.
    fn disconnect(&mut self);

    /// Releases the device.
    fn stop_tracks(&mut self);
}

/// Per-block work done on the capture thread. Never blocks.
#[derive(Clone)]
pub struct CaptureSink {
    link: Arc<dyn TransportHandle>,
    meter: LevelMeter,
    gain: f32,
    sample_rate: u32,
    streaming: Arc<AtomicBool>,
    stats: Arc<SessionStats>,
}

impl CaptureSink {
    pub fn new(
        link: Arc<dyn TransportHandle>,
        meter: LevelMeter,
        gain: f32,
        sample_rate: u32,
        stats: Arc<SessionStats>,
    ) -> Self {
        Self {
            link,
            meter,
            gain,
            sample_rate,
            streaming: Arc::new(AtomicBool::new(true)),
            stats,
        }
    }

    pub fn process_block(&self, block: &[f32]) {
        if !self.streaming.load(Ordering::Acquire) {
            return;
        }
        self.meter.observe(block, self.gain);
        let frame = AudioFrame::from_f32(block, self.sample_rate);
        self.link.send(frame.encode());
        self.stats.frame_sent();
    }

    /// Blocks arriving after this are ignored, including ones already in flight.
    pub fn close(&self) {
        self.streaming.store(false, Ordering::Release);
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::Acquire)
    }
}

pub struct CaptureUnit {
    stream: Box<dyn MicrophoneStream>,
    sink: Option<CaptureSink>,
    tracks_stopped: bool,
}

impl CaptureUnit {
    /// Acquires the microphone. Does not stream yet.
    pub async fn start(
        backend: &dyn AudioBackend,
        constraints: &CaptureConstraints,
    ) -> Result<Self, PipelineError> {
        let stream = backend.open_microphone(constraints).await?;
        log::info!(
            "Microphone acquired: rate={}, block={} ({:.0} ms)",
            constraints.sample_rate,
            constraints.block_size,
            constraints.block_duration() * 1000.0,
        );
        Ok(Self {
            stream,
            sink: None,
            tracks_stopped: false,
        })
    }

    /// Installs the per-block callback; frames flow to the sink's transport
    /// handle from here on.
    pub fn begin_streaming(&mut self, sink: CaptureSink) -> Result<(), PipelineError> {
        if self.tracks_stopped {
            return Err(PipelineError::DeviceUnavailable(
                "microphone already released".into(),
            ));
        }
        if self.sink.is_some() {
            return Ok(());
        }
        self.stream
            .connect(sink.clone())
            .map_err(|e| PipelineError::DeviceUnavailable(format!("{:#}", e)))?;
        self.sink = Some(sink);
        Ok(())
    }

    pub fn is_streaming(&self) -> bool {
        self.sink.as_ref().is_some_and(CaptureSink::is_streaming)
    }

    pub fn stop_tracks(&mut self) {
        if self.tracks_stopped {
            return;
        }
        self.tracks_stopped = true;
        if let Some(sink) = &self.sink {
            sink.close();
        }
        self.stream.stop_tracks();
    }

    pub fn disconnect(&mut self) {
        if let Some(sink) = self.sink.take() {
            sink.close();
            self.stream.disconnect();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RecordingLink, TestBackend};

    fn constraints() -> CaptureConstraints {
        CaptureConstraints {
            sample_rate: 16000,
            block_size: 4096,
            channels: 1,
            echo_cancellation: true,
            noise_suppression: true,
        }
    }

    fn sink(link: Arc<RecordingLink>, meter: LevelMeter) -> CaptureSink {
        CaptureSink::new(link, meter, 1.0, 16000, Arc::new(SessionStats::default()))
    }

    #[test]
    fn block_is_about_256_ms() {
        assert_eq!(constraints().block_duration(), 0.256);
    }

    #[tokio::test]
    async fn denied_microphone_surfaces_permission_error() {
        let backend = TestBackend::denying("user dismissed prompt");
        let err = CaptureUnit::start(&backend, &constraints()).await.err().unwrap();
        assert!(matches!(err, PipelineError::PermissionDenied(_)));
    }

    #[tokio::test]
    async fn nothing_is_sent_before_streaming_begins() {
        let backend = TestBackend::new();
        let link = Arc::new(RecordingLink::default());
        let mut unit = CaptureUnit::start(&backend, &constraints()).await.unwrap();

        backend.microphone().push(&[0.5; 4096]);
        assert_eq!(link.frames().len(), 0);

        unit.begin_streaming(sink(link.clone(), LevelMeter::new())).unwrap();
        backend.microphone().push(&[0.5; 4096]);
        let frames = link.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].mime_type, "audio/pcm;rate=16000");
        assert_eq!(frames[0].payload().unwrap().len(), 4096 * 2);
    }

    #[tokio::test]
    async fn block_updates_level_meter() {
        let backend = TestBackend::new();
        let link = Arc::new(RecordingLink::default());
        let meter = LevelMeter::new();
        let mut unit = CaptureUnit::start(&backend, &constraints()).await.unwrap();
        unit.begin_streaming(sink(link, meter.clone())).unwrap();

        backend.microphone().push(&[0.25; 4096]);
        assert!((meter.level() - 0.25).abs() < 1e-6);
    }

    #[tokio::test]
    async fn in_flight_blocks_are_dropped_after_stop() {
        let backend = TestBackend::new();
        let link = Arc::new(RecordingLink::default());
        let mut unit = CaptureUnit::start(&backend, &constraints()).await.unwrap();
        let s = sink(link.clone(), LevelMeter::new());
        unit.begin_streaming(s.clone()).unwrap();

        unit.stop_tracks();
        unit.disconnect();
        // a callback that was already running when the graph was torn down
        s.process_block(&[0.5; 4096]);
        assert!(link.frames().is_empty());
        assert!(backend.microphone().tracks_stopped());
        assert!(backend.microphone().disconnected());

        // idempotent
        unit.stop_tracks();
        unit.disconnect();
        assert!(unit.begin_streaming(s).is_err());
    }
}
