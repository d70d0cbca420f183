//! In-process transport: the "remote" end is a [`RemoteEnd`] held by the caller.
//!
//! Used by the tests and by the binary's echo mode.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::audio::pcm::AudioFrame;
use crate::protocol::{EncodedFrame, ServerMessage, SessionConfig};
use crate::transport::{Transport, TransportEvent, TransportHandle, TransportSession};

#[derive(Default)]
struct Shared {
    refusal: Mutex<Option<String>>,
    config: Mutex<Option<SessionConfig>>,
    opens: AtomicUsize,
    closed: AtomicBool,
}

struct Pending {
    events: mpsc::Receiver<TransportEvent>,
    frames: mpsc::UnboundedSender<EncodedFrame>,
}

pub struct LoopbackTransport {
    pending: Mutex<Option<Pending>>,
    shared: Arc<Shared>,
}

/// The endpoint side of a [`LoopbackTransport`].
pub struct RemoteEnd {
    events: mpsc::Sender<TransportEvent>,
    frames: mpsc::UnboundedReceiver<EncodedFrame>,
    shared: Arc<Shared>,
}

impl LoopbackTransport {
    pub fn new(event_buffer: usize) -> (Self, RemoteEnd) {
        let (tx_event, rx_event) = mpsc::channel(event_buffer.max(1));
        let (tx_frame, rx_frame) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared::default());
        let transport = Self {
            pending: Mutex::new(Some(Pending {
                events: rx_event,
                frames: tx_frame,
            })),
            shared: shared.clone(),
        };
        let remote = RemoteEnd {
            events: tx_event,
            frames: rx_frame,
            shared,
        };
        (transport, remote)
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn open(&self, config: SessionConfig) -> anyhow::Result<TransportSession> {
        self.shared.opens.fetch_add(1, Ordering::SeqCst);
        if let Some(reason) = lock(&self.shared.refusal).take() {
            return Err(anyhow!("remote refused session: {}", reason));
        }
        let pending = lock(&self.pending)
            .take()
            .ok_or_else(|| anyhow!("loopback transport already opened"))?;
        *lock(&self.shared.config) = Some(config);

        let handle = LoopbackHandle {
            frames: pending.frames,
            shared: self.shared.clone(),
        };
        Ok(TransportSession {
            handle: Arc::new(handle),
            events: pending.events,
        })
    }
}

struct LoopbackHandle {
    frames: mpsc::UnboundedSender<EncodedFrame>,
    shared: Arc<Shared>,
}

#[async_trait]
impl TransportHandle for LoopbackHandle {
    fn send(&self, frame: EncodedFrame) {
        if self.shared.closed.load(Ordering::Acquire) {
            return;
        }
        if self.frames.send(frame).is_err() {
            log::trace!("loopback remote gone, frame dropped");
        }
    }

    async fn close(&self) -> anyhow::Result<()> {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return Err(anyhow!("loopback session already closed"));
        }
        Ok(())
    }
}

impl RemoteEnd {
    /// Makes the next `open` fail.
    pub fn refuse_open(&self, reason: &str) {
        *lock(&self.shared.refusal) = Some(reason.to_string());
    }

    pub fn open_calls(&self) -> usize {
        self.shared.opens.load(Ordering::SeqCst)
    }

    /// Config received by the last successful `open`.
    pub fn config(&self) -> Option<SessionConfig> {
        lock(&self.shared.config).clone()
    }

    /// True once the client closed its handle.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    pub async fn emit(&self, event: TransportEvent) -> anyhow::Result<()> {
        self.events
            .send(event)
            .await
            .map_err(|_| anyhow!("client event stream dropped"))
    }

    pub async fn accept(&self) -> anyhow::Result<()> {
        self.emit(TransportEvent::Open).await
    }

    pub async fn send(&self, msg: ServerMessage) -> anyhow::Result<()> {
        self.emit(TransportEvent::Message(msg)).await
    }

    /// Sends mono PCM16 as one reply chunk.
    pub async fn send_audio(&self, samples: &[i16], sample_rate: u32) -> anyhow::Result<()> {
        let frame = AudioFrame {
            sample_rate,
            samples: samples.to_vec(),
        };
        self.send(ServerMessage::audio(frame.encode())).await
    }

    pub async fn turn_complete(&self) -> anyhow::Result<()> {
        self.send(ServerMessage::turn_complete()).await
    }

    pub async fn interrupt(&self) -> anyhow::Result<()> {
        self.send(ServerMessage::interrupted()).await
    }

    pub async fn close(&self, reason: Option<&str>) -> anyhow::Result<()> {
        self.emit(TransportEvent::Close(reason.map(str::to_string))).await
    }

    pub async fn fail(&self, error: &str) -> anyhow::Result<()> {
        self.emit(TransportEvent::Error(error.to_string())).await
    }

    pub async fn next_frame(&mut self) -> Option<EncodedFrame> {
        self.frames.recv().await
    }

    pub fn try_next_frame(&mut self) -> Option<EncodedFrame> {
        self.frames.try_recv().ok()
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
