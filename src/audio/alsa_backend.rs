//! ALSA-backed microphone and output context.
//!
//! Device I/O runs on dedicated std threads, never on tokio workers. The
//! playback thread pulls periods from a [`MixerOutput`], so the mixer clock
//! follows the hardware.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use super::alsa_device;
use super::capture::{CaptureConstraints, CaptureSink, MicrophoneStream};
use super::mixer::MixerOutput;
use super::output::{AudioBackend, ChunkId, OutputDevice};
use super::pcm::PlaybackChunk;
use crate::error::PipelineError;

const EACCES: i32 = 13;
const EPERM: i32 = 1;
/// Consecutive failed writes before a period is dropped.
const MAX_WRITE_RETRIES: u32 = 3;

pub struct AlsaBackend {
    capture_device: String,
    playback_device: String,
    period_size: usize,
}

impl AlsaBackend {
    pub fn new(capture_device: &str, playback_device: &str, period_size: usize) -> Self {
        Self {
            capture_device: capture_device.to_string(),
            playback_device: playback_device.to_string(),
            period_size,
        }
    }
}

fn classify(err: anyhow::Error) -> PipelineError {
    let errno = err.downcast_ref::<alsa::Error>().map(|e| e.errno());
    match errno {
        Some(EACCES) | Some(EPERM) => PipelineError::PermissionDenied(format!("{:#}", err)),
        _ => PipelineError::DeviceUnavailable(format!("{:#}", err)),
    }
}

#[async_trait]
impl AudioBackend for AlsaBackend {
    async fn open_microphone(
        &self,
        constraints: &CaptureConstraints,
    ) -> Result<Box<dyn MicrophoneStream>, PipelineError> {
        if constraints.echo_cancellation || constraints.noise_suppression {
            log::debug!("ALSA capture ignores echo cancellation / noise suppression hints");
        }
        let running = Arc::new(AtomicBool::new(true));
        let sink: Arc<Mutex<Option<CaptureSink>>> = Arc::new(Mutex::new(None));
        let (ready_tx, ready_rx) = oneshot::channel();

        let device = self.capture_device.clone();
        let constraints = constraints.clone();
        let thread_running = running.clone();
        let thread_sink = sink.clone();
        let handle = thread::Builder::new()
            .name("audio-capture".into())
            .spawn(move || capture_thread(&device, &constraints, &thread_running, &thread_sink, ready_tx))
            .map_err(|e| PipelineError::DeviceUnavailable(format!("spawn capture thread: {}", e)))?;

        match ready_rx.await {
            Ok(Ok(())) => Ok(Box::new(AlsaMicrophone {
                running,
                sink,
                thread: Some(handle),
            })),
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => Err(PipelineError::DeviceUnavailable("capture thread exited".into())),
        }
    }

    fn open_output(
        &self,
        sample_rate: u32,
        ended: mpsc::UnboundedSender<ChunkId>,
    ) -> Result<Box<dyn OutputDevice>, PipelineError> {
        let (pcm, negotiated) = alsa_device::open_speaker(&self.playback_device, sample_rate, self.period_size)
            .map_err(classify)?;
        if negotiated.sample_rate != sample_rate {
            return Err(PipelineError::DeviceUnavailable(format!(
                "speaker runs at {} Hz, wanted {}",
                negotiated.sample_rate, sample_rate
            )));
        }

        let mixer = MixerOutput::new(sample_rate, ended);
        let running = Arc::new(AtomicBool::new(true));
        let thread_mixer = mixer.clone();
        let thread_running = running.clone();
        let handle = thread::Builder::new()
            .name("audio-playback".into())
            .spawn(move || {
                if let Err(e) = playback_thread(pcm, negotiated.period_size, &thread_mixer, &thread_running) {
                    log::error!("Playback thread error: {:#}", e);
                }
            })
            .map_err(|e| PipelineError::DeviceUnavailable(format!("spawn playback thread: {}", e)))?;

        Ok(Box::new(AlsaOutput {
            mixer,
            running,
            thread: Some(handle),
        }))
    }
}

fn capture_thread(
    device: &str,
    constraints: &CaptureConstraints,
    running: &AtomicBool,
    sink: &Mutex<Option<CaptureSink>>,
    ready: oneshot::Sender<Result<(), PipelineError>>,
) {
    let opened = alsa_device::open_microphone(device, constraints.sample_rate, constraints.channels)
        .map_err(classify)
        .and_then(|(pcm, negotiated)| {
            if negotiated.sample_rate != constraints.sample_rate {
                return Err(PipelineError::DeviceUnavailable(format!(
                    "microphone runs at {} Hz, wanted {}",
                    negotiated.sample_rate, constraints.sample_rate
                )));
            }
            Ok((pcm, negotiated))
        });
    let (pcm, negotiated) = match opened {
        Ok(opened) => {
            let _ = ready.send(Ok(()));
            opened
        }
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    let io = match pcm.io_f32() {
        Ok(io) => io,
        Err(e) => {
            log::error!("ALSA capture io: {}", e);
            return;
        }
    };

    let channels = constraints.channels.max(1) as usize;
    let mut read_buf = vec![0f32; negotiated.period_size * channels];
    let mut block: Vec<f32> = Vec::with_capacity(constraints.block_size * 2);

    while running.load(Ordering::Relaxed) {
        match io.readi(&mut read_buf) {
            Ok(frames) => {
                // 多声道时只取第一个声道
                block.extend(read_buf[..frames * channels].iter().step_by(channels));
                while block.len() >= constraints.block_size {
                    let current = sink.lock().unwrap_or_else(PoisonError::into_inner).clone();
                    if let Some(current) = current {
                        current.process_block(&block[..constraints.block_size]);
                    }
                    block.drain(..constraints.block_size);
                }
            }
            Err(e) => {
                log::warn!("ALSA capture error: {}, recovering...", e);
                if let Err(e2) = pcm.prepare() {
                    log::error!("Failed to recover PCM capture: {}", e2);
                    break;
                }
            }
        }
    }
    log::info!("Capture thread stopped");
}

fn playback_thread(
    pcm: alsa::PCM,
    period_size: usize,
    mixer: &MixerOutput,
    running: &AtomicBool,
) -> anyhow::Result<()> {
    let io = pcm.io_f32()?;
    let mut period = vec![0f32; period_size.max(1)];

    while running.load(Ordering::Relaxed) {
        mixer.render(&mut period);

        let mut written = 0;
        let mut retries = 0u32;
        while written < period.len() {
            match io.writei(&period[written..]) {
                Ok(n) => {
                    written += n;
                    retries = 0;
                }
                Err(e) => {
                    log::warn!("ALSA XRUN or error: {}, recovering...", e);
                    retries += 1;
                    if let Err(e2) = pcm.prepare() {
                        anyhow::bail!("failed to recover PCM playback: {}", e2);
                    }
                    // 熔断：持续写不进去就丢掉本周期剩余帧
                    if retries >= MAX_WRITE_RETRIES {
                        log::error!(
                            "Dropping {} frames after {} failed writes",
                            period.len() - written,
                            retries
                        );
                        break;
                    }
                }
            }
        }
    }

    log::info!("Playback thread stopped");
    Ok(())
}

struct AlsaMicrophone {
    running: Arc<AtomicBool>,
    sink: Arc<Mutex<Option<CaptureSink>>>,
    thread: Option<JoinHandle<()>>,
}

impl MicrophoneStream for AlsaMicrophone {
    fn connect(&mut self, sink: CaptureSink) -> anyhow::Result<()> {
        if self.thread.is_none() {
            anyhow::bail!("microphone already stopped");
        }
        *self.sink.lock().unwrap_or_else(PoisonError::into_inner) = Some(sink);
        Ok(())
    }

    fn disconnect(&mut self) {
        self.sink.lock().unwrap_or_else(PoisonError::into_inner).take();
    }

    fn stop_tracks(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                log::error!("Capture thread panicked");
            }
        }
    }
}

impl Drop for AlsaMicrophone {
    fn drop(&mut self) {
        self.stop_tracks();
    }
}

struct AlsaOutput {
    mixer: MixerOutput,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl OutputDevice for AlsaOutput {
    fn now(&self) -> f64 {
        self.mixer.now()
    }

    fn start(&mut self, id: ChunkId, chunk: PlaybackChunk, at: f64) -> Result<f64, PipelineError> {
        self.mixer.start(id, chunk, at)
    }

    fn stop(&mut self, id: ChunkId) {
        self.mixer.stop(id);
    }

    fn close(&mut self) -> anyhow::Result<()> {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                log::error!("Playback thread panicked");
            }
        }
        self.mixer.close()
    }

    fn is_closed(&self) -> bool {
        self.mixer.is_closed()
    }
}

impl Drop for AlsaOutput {
    fn drop(&mut self) {
        if !self.is_closed() {
            let _ = self.close();
        }
    }
}
