//! Software output context.
//!
//! Keeps a sample-accurate timeline of scheduled chunks and renders it into
//! periods on demand. The output clock is the number of frames rendered so
//! far; whoever pulls periods (the playback thread, or a test) drives it.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;

use super::output::{ChunkId, OutputDevice};
use super::pcm::PlaybackChunk;
use crate::error::PipelineError;

struct Voice {
    id: ChunkId,
    start_frame: u64,
    samples: Vec<f32>,
}

impl Voice {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }
}

/// A chunk as placed on the timeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlacedChunk {
    pub id: ChunkId,
    pub start: f64,
    pub duration: f64,
}

pub struct Mixer {
    sample_rate: u32,
    frames_rendered: u64,
    voices: Vec<Voice>,
    ended: mpsc::UnboundedSender<ChunkId>,
    closed: bool,
}

impl Mixer {
    pub fn new(sample_rate: u32, ended: mpsc::UnboundedSender<ChunkId>) -> Self {
        Self {
            sample_rate,
            frames_rendered: 0,
            voices: Vec::new(),
            ended,
            closed: false,
        }
    }

    pub fn now(&self) -> f64 {
        self.frames_rendered as f64 / self.sample_rate as f64
    }

    /// Returns the start time actually used.
    pub fn add(&mut self, id: ChunkId, chunk: PlaybackChunk, at: f64) -> Result<f64, PipelineError> {
        if self.closed {
            return Err(PipelineError::Schedule("output context closed".into()));
        }
        if chunk.sample_rate != self.sample_rate {
            return Err(PipelineError::Schedule(format!(
                "chunk rate {} does not match output rate {}",
                chunk.sample_rate, self.sample_rate
            )));
        }
        if !at.is_finite() {
            return Err(PipelineError::Schedule(format!("bad start time {}", at)));
        }
        let start_frame = ((at * self.sample_rate as f64).round() as u64).max(self.frames_rendered);
        self.voices.push(Voice {
            id,
            start_frame,
            samples: chunk.samples,
        });
        Ok(start_frame as f64 / self.sample_rate as f64)
    }

    /// Removes a chunk without an ended notification.
    pub fn remove(&mut self, id: ChunkId) -> bool {
        let before = self.voices.len();
        self.voices.retain(|v| v.id != id);
        self.voices.len() != before
    }

    /// Mixes the next `out.len()` frames and advances the clock.
    pub fn render(&mut self, out: &mut [f32]) {
        out.fill(0.0);
        if self.closed {
            return;
        }
        let window_start = self.frames_rendered;
        let window_end = window_start + out.len() as u64;

        for voice in &self.voices {
            if voice.start_frame >= window_end || voice.end_frame() <= window_start {
                continue;
            }
            let from = voice.start_frame.max(window_start);
            let to = voice.end_frame().min(window_end);
            for frame in from..to {
                out[(frame - window_start) as usize] += voice.samples[(frame - voice.start_frame) as usize];
            }
        }
        for s in out.iter_mut() {
            *s = s.clamp(-1.0, 1.0);
        }

        self.frames_rendered = window_end;
        let ended = &self.ended;
        self.voices.retain(|v| {
            if v.end_frame() <= window_end {
                // 接收端已关闭时忽略
                let _ = ended.send(v.id);
                false
            } else {
                true
            }
        });
    }

    pub fn timeline(&self) -> Vec<PlacedChunk> {
        let rate = self.sample_rate as f64;
        self.voices
            .iter()
            .map(|v| PlacedChunk {
                id: v.id,
                start: v.start_frame as f64 / rate,
                duration: v.samples.len() as f64 / rate,
            })
            .collect()
    }

    pub fn close(&mut self) {
        self.closed = true;
        self.voices.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

/// Shared handle to a [`Mixer`]; the device side and the render side hold clones.
#[derive(Clone)]
pub struct MixerOutput {
    inner: Arc<Mutex<Mixer>>,
}

impl MixerOutput {
    pub fn new(sample_rate: u32, ended: mpsc::UnboundedSender<ChunkId>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Mixer::new(sample_rate, ended))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Mixer> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn render(&self, out: &mut [f32]) {
        self.lock().render(out);
    }

    /// Advances the clock by `frames`, discarding the output.
    pub fn advance(&self, frames: usize) {
        let mut scratch = vec![0.0; frames];
        self.render(&mut scratch);
    }

    pub fn timeline(&self) -> Vec<PlacedChunk> {
        self.lock().timeline()
    }
}

impl OutputDevice for MixerOutput {
    fn now(&self) -> f64 {
        self.lock().now()
    }

    fn start(&mut self, id: ChunkId, chunk: PlaybackChunk, at: f64) -> Result<f64, PipelineError> {
        self.lock().add(id, chunk, at)
    }

    fn stop(&mut self, id: ChunkId) {
        self.lock().remove(id);
    }

    fn close(&mut self) -> anyhow::Result<()> {
        let mut mixer = self.lock();
        if mixer.is_closed() {
            anyhow::bail!("output context already closed");
        }
        mixer.close();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.lock().is_closed()
    }
}
