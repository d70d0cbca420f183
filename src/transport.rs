//! Seam to the remote conversational endpoint.
//!
//! A transport opens one session and hands back a send handle plus a single
//! event stream; the controller consumes that stream from its dispatch loop.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::protocol::{EncodedFrame, ServerMessage, SessionConfig};

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Remote side is ready for audio.
    Open,
    Message(ServerMessage),
    Close(Option<String>),
    Error(String),
}

#[async_trait]
pub trait TransportHandle: Send + Sync {
    /// Fire-and-forget. Must not block: it is called from the capture thread.
    fn send(&self, frame: EncodedFrame);

    /// Best-effort.
    async fn close(&self) -> anyhow::Result<()>;
}

pub struct TransportSession {
    pub handle: Arc<dyn TransportHandle>,
    pub events: mpsc::Receiver<TransportEvent>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, config: SessionConfig) -> anyhow::Result<TransportSession>;
}
