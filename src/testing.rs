//! Test doubles: a scripted microphone, a journaling output context and a
//! recording transport handle.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::audio::capture::{CaptureConstraints, CaptureSink, MicrophoneStream};
use crate::audio::mixer::MixerOutput;
use crate::audio::output::{AudioBackend, ChunkId, OutputDevice};
use crate::audio::pcm::PlaybackChunk;
use crate::error::PipelineError;
use crate::protocol::EncodedFrame;
use crate::transport::TransportHandle;

/// Ordered log of release-relevant calls across doubles.
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<&'static str>>>);

impl Journal {
    pub fn record(&self, entry: &'static str) {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).push(entry);
    }

    pub fn entries(&self) -> Vec<&'static str> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[derive(Default)]
struct MicState {
    sink: Mutex<Option<CaptureSink>>,
    tracks_stopped: AtomicBool,
    disconnected: AtomicBool,
}

/// Test-side view of the scripted microphone.
#[derive(Clone, Default)]
pub struct MicProbe {
    state: Arc<MicState>,
}

impl MicProbe {
    /// Delivers one block as the device thread would.
    pub fn push(&self, block: &[f32]) {
        let sink = self.state.sink.lock().unwrap().clone();
        if let Some(sink) = sink {
            sink.process_block(block);
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state.sink.lock().unwrap().is_some()
    }

    pub fn tracks_stopped(&self) -> bool {
        self.state.tracks_stopped.load(Ordering::SeqCst)
    }

    pub fn disconnected(&self) -> bool {
        self.state.disconnected.load(Ordering::SeqCst)
    }
}

struct ScriptedMicrophone {
    state: Arc<MicState>,
    journal: Journal,
}

impl MicrophoneStream for ScriptedMicrophone {
    fn connect(&mut self, sink: CaptureSink) -> anyhow::Result<()> {
        *self.state.sink.lock().unwrap() = Some(sink);
        Ok(())
    }

    fn disconnect(&mut self) {
        self.state.sink.lock().unwrap().take();
        self.state.disconnected.store(true, Ordering::SeqCst);
        self.journal.record("mic.disconnect");
    }

    fn stop_tracks(&mut self) {
        self.state.tracks_stopped.store(true, Ordering::SeqCst);
        self.journal.record("mic.stop_tracks");
    }
}

struct JournaledOutput {
    inner: MixerOutput,
    journal: Journal,
}

impl OutputDevice for JournaledOutput {
    fn now(&self) -> f64 {
        self.inner.now()
    }

    fn start(&mut self, id: ChunkId, chunk: PlaybackChunk, at: f64) -> Result<f64, PipelineError> {
        self.inner.start(id, chunk, at)
    }

    fn stop(&mut self, id: ChunkId) {
        self.inner.stop(id)
    }

    fn close(&mut self) -> anyhow::Result<()> {
        self.journal.record("output.close");
        self.inner.close()
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

pub struct TestBackend {
    mic: MicProbe,
    deny: Option<String>,
    /// Holds microphone acquisition until notified.
    gate: Option<Arc<tokio::sync::Notify>>,
    output: Mutex<Option<MixerOutput>>,
    journal: Journal,
}

impl TestBackend {
    pub fn new() -> Self {
        Self {
            mic: MicProbe::default(),
            deny: None,
            gate: None,
            output: Mutex::new(None),
            journal: Journal::default(),
        }
    }

    pub fn denying(reason: &str) -> Self {
        Self {
            deny: Some(reason.to_string()),
            ..Self::new()
        }
    }

    /// Microphone acquisition waits for `gate.notify_one()`.
    pub fn gated(gate: Arc<tokio::sync::Notify>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::new()
        }
    }

    pub fn microphone(&self) -> MicProbe {
        self.mic.clone()
    }

    /// The output context handed to the session, once opened.
    pub fn output(&self) -> Option<MixerOutput> {
        self.output.lock().unwrap().clone()
    }

    pub fn journal(&self) -> Journal {
        self.journal.clone()
    }
}

#[async_trait]
impl AudioBackend for TestBackend {
    async fn open_microphone(
        &self,
        _constraints: &CaptureConstraints,
    ) -> Result<Box<dyn MicrophoneStream>, PipelineError> {
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if let Some(reason) = &self.deny {
            return Err(PipelineError::PermissionDenied(reason.clone()));
        }
        Ok(Box::new(ScriptedMicrophone {
            state: self.mic.state.clone(),
            journal: self.journal.clone(),
        }))
    }

    fn open_output(
        &self,
        sample_rate: u32,
        ended: mpsc::UnboundedSender<ChunkId>,
    ) -> Result<Box<dyn OutputDevice>, PipelineError> {
        let output = MixerOutput::new(sample_rate, ended);
        *self.output.lock().unwrap() = Some(output.clone());
        Ok(Box::new(JournaledOutput {
            inner: output,
            journal: self.journal.clone(),
        }))
    }
}

/// Transport handle that keeps every frame it is given.
#[derive(Default)]
pub struct RecordingLink {
    frames: Mutex<Vec<EncodedFrame>>,
    closes: AtomicUsize,
    fail_close: bool,
    journal: Option<Journal>,
}

impl RecordingLink {
    pub fn with_journal(journal: Journal) -> Self {
        Self {
            journal: Some(journal),
            ..Default::default()
        }
    }

    pub fn failing_close() -> Self {
        Self {
            fail_close: true,
            ..Default::default()
        }
    }

    pub fn frames(&self) -> Vec<EncodedFrame> {
        self.frames.lock().unwrap().clone()
    }

    pub fn close_calls(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransportHandle for RecordingLink {
    fn send(&self, frame: EncodedFrame) {
        self.frames.lock().unwrap().push(frame);
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        if let Some(journal) = &self.journal {
            journal.record("link.close");
        }
        if self.fail_close {
            anyhow::bail!("socket already gone");
        }
        Ok(())
    }
}
