//! Host-facing handle for one voice call.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::audio::meter::LevelMeter;
use crate::audio::output::AudioBackend;
use crate::config::Config;
use crate::controller::{Command, SessionController};
use crate::error::PipelineError;
use crate::state_machine::{SessionState, Trigger};
use crate::stats::{SessionStats, StatsSnapshot};
use crate::transport::Transport;

/// One voice call. Single-use: once it reaches `Closed` or `Error` a new
/// instance is needed for the next call.
///
/// ```no_run
/// # use std::sync::Arc;
/// # use voice_loop::{Config, VoiceSession};
/// # async fn demo(transport: Arc<dyn voice_loop::Transport>, backend: Arc<dyn voice_loop::AudioBackend>) -> anyhow::Result<()> {
/// let config = Config::new().map_err(anyhow::Error::msg)?;
/// let mut session = VoiceSession::new(config, "You are a friendly tutor.", transport, backend);
/// session.start()?;
/// // ... later
/// session.stop().await;
/// # Ok(())
/// # }
/// ```
pub struct VoiceSession {
    id: Uuid,
    config: Config,
    persona: String,
    transport: Arc<dyn Transport>,
    backend: Arc<dyn AudioBackend>,
    state_rx: watch::Receiver<SessionState>,
    error_rx: watch::Receiver<Option<PipelineError>>,
    // 启动前由会话持有，启动后移交给控制器
    idle: Option<(watch::Sender<SessionState>, watch::Sender<Option<PipelineError>>)>,
    meter: LevelMeter,
    stats: Arc<SessionStats>,
    commands: Option<mpsc::Sender<Command>>,
    task: Option<JoinHandle<()>>,
}

impl VoiceSession {
    pub fn new(
        config: Config,
        persona: impl Into<String>,
        transport: Arc<dyn Transport>,
        backend: Arc<dyn AudioBackend>,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        let (error_tx, error_rx) = watch::channel(None);
        Self {
            id: Uuid::new_v4(),
            config,
            persona: persona.into(),
            transport,
            backend,
            state_rx,
            error_rx,
            idle: Some((state_tx, error_tx)),
            meter: LevelMeter::new(),
            stats: Arc::new(SessionStats::default()),
            commands: None,
            task: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    /// Microphone level in [0, 1].
    pub fn level(&self) -> f32 {
        self.meter.level()
    }

    /// The fatal error that ended the session, if any.
    pub fn last_error(&self) -> Option<PipelineError> {
        self.error_rx.borrow().clone()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Idle -> Connecting, then acquires the microphone, the output context and
    /// the remote session in the background. Must be called inside a tokio runtime.
    pub fn start(&mut self) -> Result<(), PipelineError> {
        let Some((state_tx, error_tx)) = self.idle.take() else {
            return Err(PipelineError::AlreadyStarted);
        };
        let (cmd_tx, cmd_rx) = mpsc::channel(4);
        let mut controller = SessionController::new(
            self.id,
            self.config.clone(),
            self.persona.clone(),
            self.transport.clone(),
            self.backend.clone(),
            state_tx,
            error_tx,
            self.meter.clone(),
            self.stats.clone(),
            cmd_rx,
        );
        controller.apply(Trigger::Start);
        self.commands = Some(cmd_tx);
        self.task = Some(tokio::spawn(controller.run()));
        Ok(())
    }

    /// Releases everything and ends in `Closed` (or keeps `Error` if the
    /// session already failed). Safe to call in any state, any number of times.
    pub async fn stop(&mut self) {
        if let Some((state_tx, _)) = self.idle.take() {
            log::info!("[{}] Stopped before start", self.id);
            state_tx.send_replace(SessionState::Closed);
            return;
        }
        if let Some(commands) = self.commands.take() {
            // 控制器已退出时发送失败，直接等待任务结束
            let _ = commands.send(Command::Stop).await;
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                log::error!("[{}] Session task failed: {}", self.id, e);
            }
        }
    }

    /// Waits until the session reaches `Closed` or `Error`.
    pub async fn finished(&self) -> SessionState {
        let mut rx = self.state_rx.clone();
        let reached = rx.wait_for(|s| s.is_terminal()).await.map(|state| *state);
        // 控制器任务已退出时取最后一次发布的状态
        reached.unwrap_or_else(|_| *rx.borrow())
    }
}
