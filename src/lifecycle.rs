//! Scoped ownership of everything a call acquires, released in a fixed order:
//!
//! 1. remote session handle (best-effort close)
//! 2. microphone tracks
//! 3. capture processing graph
//! 4. output context, unless already closed
//! 5. scheduled playback chunks
//!
//! `release` may run any number of times; later runs find nothing left to do.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::audio::capture::CaptureUnit;
use crate::audio::scheduler::OutputScheduler;
use crate::transport::TransportHandle;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

pub struct SessionResources {
    session_id: Uuid,
    link: Option<Arc<dyn TransportHandle>>,
    capture: Option<CaptureUnit>,
    releases: u32,
}

impl SessionResources {
    pub fn new(session_id: Uuid) -> Self {
        Self {
            session_id,
            link: None,
            capture: None,
            releases: 0,
        }
    }

    pub fn attach_capture(&mut self, capture: CaptureUnit) {
        self.capture = Some(capture);
    }

    pub fn attach_link(&mut self, link: Arc<dyn TransportHandle>) {
        self.link = Some(link);
    }

    pub fn capture_mut(&mut self) -> Option<&mut CaptureUnit> {
        self.capture.as_mut()
    }

    pub fn link(&self) -> Option<Arc<dyn TransportHandle>> {
        self.link.clone()
    }

    pub fn is_released(&self) -> bool {
        self.releases > 0
    }

    pub async fn release(&mut self, playback: Option<&mut OutputScheduler>) {
        self.releases += 1;
        if self.releases > 1 {
            log::debug!("[{}] release #{}", self.session_id, self.releases);
        }

        if let Some(link) = self.link.take() {
            match tokio::time::timeout(CLOSE_TIMEOUT, link.close()).await {
                Ok(Ok(())) => log::debug!("[{}] Remote session closed", self.session_id),
                Ok(Err(e)) => log::debug!("[{}] Remote close failed: {:#}", self.session_id, e),
                Err(_) => log::warn!("[{}] Remote close timed out", self.session_id),
            }
        }

        self.release_capture();

        if let Some(playback) = playback {
            playback.close_device();
            playback.halt();
        }
    }

    fn release_capture(&mut self) {
        if let Some(mut capture) = self.capture.take() {
            capture.stop_tracks();
            capture.disconnect();
            log::info!("[{}] Microphone released", self.session_id);
        }
    }
}

impl Drop for SessionResources {
    // 主机直接丢弃会话时的兜底：同步部分立即释放，远端关闭交给运行时
    fn drop(&mut self) {
        if let Some(link) = self.link.take() {
            if let Ok(rt) = tokio::runtime::Handle::try_current() {
                rt.spawn(async move {
                    let _ = link.close().await;
                });
            }
        }
        self.release_capture();
    }
}
