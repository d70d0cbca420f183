//! Output playback scheduler.
//!
//! Inbound chunks are decoded off-thread but committed strictly in arrival
//! order, then placed back to back on the output clock:
//!
//! ```text
//! start  = max(now, cursor)
//! cursor = start + duration
//! ```
//!
//! The cursor belongs to this instance; two sessions never share one.

use std::collections::BTreeMap;

use futures_util::StreamExt;
use futures_util::future::BoxFuture;
use futures_util::stream::FuturesOrdered;

use super::output::{ChunkId, OutputDevice};
use super::pcm::PlaybackChunk;
use crate::error::PipelineError;
use crate::protocol::EncodedFrame;

/// Where a chunk landed on the output clock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledSpan {
    pub id: ChunkId,
    pub start: f64,
    pub duration: f64,
}

impl ScheduledSpan {
    pub fn end(&self) -> f64 {
        self.start + self.duration
    }
}

/// Interprets an inbound chunk as mono PCM16 LE at `sample_rate`.
pub async fn decode(frame: EncodedFrame, sample_rate: u32) -> Result<PlaybackChunk, PipelineError> {
    tokio::task::spawn_blocking(move || decode_frame(&frame, sample_rate))
        .await
        .map_err(|e| PipelineError::Decode(format!("decode task failed: {}", e)))?
}

fn decode_frame(frame: &EncodedFrame, sample_rate: u32) -> Result<PlaybackChunk, PipelineError> {
    if !frame.is_pcm() {
        return Err(PipelineError::Decode(format!(
            "unsupported encoding '{}'",
            frame.mime_type
        )));
    }
    if let Some(rate) = frame.sample_rate() {
        if rate != sample_rate {
            return Err(PipelineError::Decode(format!(
                "chunk rate {} does not match playback rate {}",
                rate, sample_rate
            )));
        }
    }
    let bytes = frame.payload()?;
    PlaybackChunk::from_pcm16_le(&bytes, sample_rate)
}

pub struct OutputScheduler {
    device: Box<dyn OutputDevice>,
    sample_rate: u32,
    cursor: f64,
    active: BTreeMap<ChunkId, ScheduledSpan>,
    next_id: ChunkId,
    decoding: FuturesOrdered<BoxFuture<'static, Result<PlaybackChunk, PipelineError>>>,
    halted: bool,
}

impl OutputScheduler {
    pub fn new(device: Box<dyn OutputDevice>, sample_rate: u32) -> Self {
        let cursor = device.now();
        Self {
            device,
            sample_rate,
            cursor,
            active: BTreeMap::new(),
            next_id: 0,
            decoding: FuturesOrdered::new(),
            halted: false,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn now(&self) -> f64 {
        self.device.now()
    }

    /// Next free start time on the output clock.
    pub fn cursor(&self) -> f64 {
        self.cursor
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    pub fn has_pending(&self) -> bool {
        !self.decoding.is_empty()
    }

    /// Nothing playing, queued, or still decoding.
    pub fn is_drained(&self) -> bool {
        self.active.is_empty() && self.decoding.is_empty()
    }

    /// Starts decoding an inbound chunk. Results come back from
    /// [`next_decoded`](Self::next_decoded) in the order chunks were enqueued.
    pub fn enqueue(&mut self, frame: EncodedFrame) {
        if self.halted {
            log::debug!("Scheduler halted, dropping inbound chunk");
            return;
        }
        let rate = self.sample_rate;
        self.decoding.push_back(Box::pin(decode(frame, rate)));
    }

    /// Oldest outstanding decode. Resolves to `None` at once when nothing is
    /// queued; in a `select!` loop guard it with [`has_pending`](Self::has_pending).
    pub async fn next_decoded(&mut self) -> Option<Result<PlaybackChunk, PipelineError>> {
        self.decoding.next().await
    }

    pub fn schedule(&mut self, chunk: PlaybackChunk) -> Result<ScheduledSpan, PipelineError> {
        if self.halted {
            return Err(PipelineError::Schedule("scheduler halted".into()));
        }
        if chunk.is_empty() {
            return Err(PipelineError::Schedule("empty chunk".into()));
        }
        let requested = self.device.now().max(self.cursor);
        let duration = chunk.duration();
        let id = self.next_id;
        self.next_id += 1;

        // 播放线程可能在读时钟之后又推进了一个周期，以设备实际放置的位置为准
        let start = self.device.start(id, chunk, requested)?;
        if start > requested {
            log::debug!("Chunk {} slipped {:.1} ms behind the cursor", id, (start - requested) * 1000.0);
        }
        self.cursor = start + duration;
        let span = ScheduledSpan { id, start, duration };
        self.active.insert(id, span);
        log::trace!("Scheduled chunk {} at {:.3}s for {:.3}s", id, start, duration);
        Ok(span)
    }

    /// Completion from the device. Returns true when this emptied the active set.
    pub fn on_ended(&mut self, id: ChunkId) -> bool {
        self.active.remove(&id).is_some() && self.active.is_empty()
    }

    /// Barge-in: stop everything, drop pending decodes, restart the timeline at now.
    pub fn flush(&mut self) -> usize {
        let stopped = self.active.len();
        for id in std::mem::take(&mut self.active).into_keys() {
            self.device.stop(id);
        }
        self.decoding = FuturesOrdered::new();
        self.cursor = self.device.now();
        stopped
    }

    pub fn close_device(&mut self) {
        if self.device.is_closed() {
            return;
        }
        if let Err(e) = self.device.close() {
            log::warn!("Failed to close output context: {:#}", e);
        }
    }

    /// Permanently stops scheduling. Decodes that finish later are discarded.
    pub fn halt(&mut self) {
        self.halted = true;
        self.flush();
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::mixer::MixerOutput;
    use crate::audio::pcm::AudioFrame;
    use tokio::sync::mpsc;

    const RATE: u32 = 24000;

    fn setup() -> (OutputScheduler, MixerOutput, mpsc::UnboundedReceiver<ChunkId>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let output = MixerOutput::new(RATE, tx);
        (OutputScheduler::new(Box::new(output.clone()), RATE), output, rx)
    }

    fn chunk(seconds: f64) -> PlaybackChunk {
        PlaybackChunk {
            sample_rate: RATE,
            samples: vec![0.1; (seconds * RATE as f64) as usize],
        }
    }

    fn frame(samples: usize) -> EncodedFrame {
        AudioFrame {
            sample_rate: RATE,
            samples: vec![1000; samples],
        }
        .encode()
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn back_to_back_without_stalls() {
        let (mut scheduler, _output, _rx) = setup();
        let durations = [0.5, 0.25, 0.125, 0.5];
        let spans: Vec<_> = durations
            .iter()
            .map(|&d| scheduler.schedule(chunk(d)).unwrap())
            .collect();
        for pair in spans.windows(2) {
            assert!(close(pair[1].start, pair[0].start + pair[0].duration));
        }
        assert_eq!(scheduler.active_len(), 4);
    }

    #[test]
    fn chunk_after_idle_gap_starts_at_now() {
        let (mut scheduler, output, _rx) = setup();
        let first = scheduler.schedule(chunk(0.5)).unwrap();
        assert!(close(first.start, 0.0));

        // network stall: clock runs 2 s past the cursor
        output.advance(2 * RATE as usize);
        let second = scheduler.schedule(chunk(0.5)).unwrap();
        assert!(close(second.start, 2.0));
        assert!(second.start >= scheduler.now());
        assert!(close(scheduler.cursor(), 2.5));
    }

    #[test]
    fn flush_clears_active_set_and_resets_cursor() {
        let (mut scheduler, output, mut rx) = setup();
        for _ in 0..3 {
            scheduler.schedule(chunk(0.5)).unwrap();
        }
        output.advance(RATE as usize / 4);
        assert_eq!(scheduler.flush(), 3);
        assert_eq!(scheduler.active_len(), 0);
        assert!(scheduler.cursor() <= scheduler.now());
        assert!(output.timeline().is_empty());

        output.advance(RATE as usize);
        assert!(rx.try_recv().is_err(), "stopped chunks must not report completion");

        let next = scheduler.schedule(chunk(0.5)).unwrap();
        assert!(close(next.start, 1.25));
    }

    #[test]
    fn ended_reports_when_set_empties() {
        let (mut scheduler, output, mut rx) = setup();
        scheduler.schedule(chunk(0.5)).unwrap();
        scheduler.schedule(chunk(0.5)).unwrap();

        output.advance(RATE as usize / 2);
        let id = rx.try_recv().unwrap();
        assert!(!scheduler.on_ended(id));

        output.advance(RATE as usize / 2);
        let id = rx.try_recv().unwrap();
        assert!(scheduler.on_ended(id));
        assert!(scheduler.is_drained());
        // unknown or repeated ids are ignored
        assert!(!scheduler.on_ended(id));
    }

    #[test]
    fn failed_schedule_leaves_cursor_untouched() {
        let (mut scheduler, mut output, _rx) = setup();
        scheduler.schedule(chunk(0.5)).unwrap();
        let cursor = scheduler.cursor();
        output.close().unwrap();
        assert!(matches!(scheduler.schedule(chunk(0.5)), Err(PipelineError::Schedule(_))));
        assert_eq!(scheduler.cursor(), cursor);
        assert_eq!(scheduler.active_len(), 1);
    }

    #[tokio::test]
    async fn decode_honours_playback_rate() {
        let chunk = decode(frame(12000), RATE).await.unwrap();
        assert_eq!(chunk.duration(), 0.5);
        assert_eq!(chunk.samples[0], 1000.0 / 32768.0);

        let wrong_rate = AudioFrame {
            sample_rate: 16000,
            samples: vec![0; 16],
        }
        .encode();
        assert!(matches!(decode(wrong_rate, RATE).await, Err(PipelineError::Decode(_))));
    }

    #[tokio::test]
    async fn decodes_commit_in_arrival_order() {
        let (mut scheduler, _output, _rx) = setup();
        // large chunk first so later ones would finish decoding sooner
        let sizes = [48000usize, 240, 2400];
        for &n in &sizes {
            scheduler.enqueue(frame(n));
        }
        let mut spans = Vec::new();
        while scheduler.has_pending() {
            let chunk = scheduler.next_decoded().await.unwrap().unwrap();
            spans.push(scheduler.schedule(chunk).unwrap());
        }
        let lens: Vec<usize> = spans
            .iter()
            .map(|s| (s.duration * RATE as f64).round() as usize)
            .collect();
        assert_eq!(lens, sizes);
        assert!(spans.windows(2).all(|p| p[0].id < p[1].id && close(p[1].start, p[0].end())));
    }

    #[tokio::test]
    async fn malformed_chunk_does_not_block_followers() {
        let (mut scheduler, _output, _rx) = setup();
        scheduler.enqueue(EncodedFrame {
            mime_type: "audio/pcm;rate=24000".into(),
            data: "@@@".into(),
        });
        scheduler.enqueue(frame(240));

        assert!(matches!(
            scheduler.next_decoded().await,
            Some(Err(PipelineError::Decode(_)))
        ));
        let chunk = scheduler.next_decoded().await.unwrap().unwrap();
        assert!(scheduler.schedule(chunk).is_ok());
    }

    #[tokio::test]
    async fn halt_discards_pending_decodes() {
        let (mut scheduler, _output, _rx) = setup();
        scheduler.enqueue(frame(240));
        scheduler.halt();
        assert!(!scheduler.has_pending());
        scheduler.enqueue(frame(240));
        assert!(!scheduler.has_pending());
        assert!(scheduler.schedule(chunk(0.1)).is_err());
    }

    /// Output whose clock moves by one period every time a chunk is placed,
    /// like a playback thread rendering between the scheduler's clock read
    /// and the placement.
    struct RacingOutput {
        inner: MixerOutput,
        period: usize,
    }

    impl OutputDevice for RacingOutput {
        fn now(&self) -> f64 {
            self.inner.now()
        }

        fn start(&mut self, id: ChunkId, chunk: PlaybackChunk, at: f64) -> Result<f64, PipelineError> {
            self.inner.advance(self.period);
            self.inner.start(id, chunk, at)
        }

        fn stop(&mut self, id: ChunkId) {
            self.inner.stop(id)
        }

        fn close(&mut self) -> anyhow::Result<()> {
            self.inner.close()
        }

        fn is_closed(&self) -> bool {
            self.inner.is_closed()
        }
    }

    fn assert_timeline_matches(output: &MixerOutput, spans: &[ScheduledSpan]) {
        let timeline = output.timeline();
        assert_eq!(timeline.len(), spans.len());
        for (placed, span) in timeline.iter().zip(spans) {
            assert_eq!(placed.id, span.id);
            assert_eq!(placed.start, span.start, "chunk {} placed away from its span", span.id);
        }
        for pair in timeline.windows(2) {
            assert!(
                pair[1].start >= pair[0].start + pair[0].duration - 1e-9,
                "chunk {} overlaps chunk {}",
                pair[1].id,
                pair[0].id
            );
        }
    }

    #[test]
    fn clock_moving_during_placement_does_not_overlap() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let output = MixerOutput::new(RATE, tx);
        let racing = RacingOutput {
            inner: output.clone(),
            period: 1024,
        };
        let mut scheduler = OutputScheduler::new(Box::new(racing), RATE);

        let first = scheduler.schedule(chunk(0.5)).unwrap();
        let second = scheduler.schedule(chunk(0.5)).unwrap();
        assert!(close(first.start, 1024.0 / RATE as f64));
        assert!(close(second.start, first.end()));
        assert!(close(scheduler.cursor(), second.end()));
        assert_timeline_matches(&output, &[first, second]);
    }

    #[test]
    fn spans_match_device_timeline_under_concurrent_render() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let output = MixerOutput::new(RATE, tx);
        let mut scheduler = OutputScheduler::new(Box::new(output.clone()), RATE);

        let render = output.clone();
        let renderer = std::thread::spawn(move || {
            let mut period = vec![0.0; 256];
            for _ in 0..200 {
                render.render(&mut period);
                std::thread::yield_now();
            }
        });
        // long chunks so nothing finishes while the renderer runs
        let spans: Vec<_> = (0..20).map(|_| scheduler.schedule(chunk(5.0)).unwrap()).collect();
        renderer.join().unwrap();

        assert_timeline_matches(&output, &spans);
        for pair in spans.windows(2) {
            assert!(pair[1].start >= pair[0].end() - 1e-9);
        }
    }
}
