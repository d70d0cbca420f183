use std::future::Future;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::audio::capture::{CaptureSink, CaptureUnit};
use crate::audio::meter::LevelMeter;
use crate::audio::output::{AudioBackend, ChunkId};
use crate::audio::pcm::PlaybackChunk;
use crate::audio::scheduler::OutputScheduler;
use crate::config::Config;
use crate::error::PipelineError;
use crate::lifecycle::SessionResources;
use crate::protocol::{EncodedFrame, ServerMessage};
use crate::state_machine::{SessionState, Trigger};
use crate::stats::SessionStats;
use crate::transport::{Transport, TransportEvent};

#[derive(Debug)]
pub(crate) enum Command {
    Stop,
}

enum Exit {
    Stopped,
    Closed(Option<String>),
    Failed(PipelineError),
}

/// Single writer of the session state. Runs one dispatch loop over the
/// transport events, decoded chunks, playback completions and host commands.
pub(crate) struct SessionController {
    pub(crate) id: Uuid,
    pub(crate) config: Config,
    pub(crate) persona: String,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) backend: Arc<dyn AudioBackend>,
    pub(crate) state: SessionState,
    pub(crate) state_tx: watch::Sender<SessionState>,
    pub(crate) error_tx: watch::Sender<Option<PipelineError>>,
    pub(crate) meter: LevelMeter,
    pub(crate) stats: Arc<SessionStats>,
    pub(crate) commands: mpsc::Receiver<Command>,
    turn_complete: bool,
}

impl SessionController {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: Uuid,
        config: Config,
        persona: String,
        transport: Arc<dyn Transport>,
        backend: Arc<dyn AudioBackend>,
        state_tx: watch::Sender<SessionState>,
        error_tx: watch::Sender<Option<PipelineError>>,
        meter: LevelMeter,
        stats: Arc<SessionStats>,
        commands: mpsc::Receiver<Command>,
    ) -> Self {
        let state = *state_tx.borrow();
        Self {
            id,
            config,
            persona,
            transport,
            backend,
            state,
            state_tx,
            error_tx,
            meter,
            stats,
            commands,
            turn_complete: false,
        }
    }

    pub(crate) fn apply(&mut self, trigger: Trigger) -> bool {
        match self.state.transition(trigger) {
            Ok(next) => {
                if next != self.state {
                    log::info!("[{}] {} -> {} ({})", self.id, self.state, next, trigger.as_str());
                    self.state = next;
                    self.state_tx.send_replace(next);
                }
                true
            }
            Err(e) => {
                log::debug!("[{}] ignored: {}", self.id, e);
                false
            }
        }
    }

    pub(crate) async fn run(mut self) {
        let mut resources = SessionResources::new(self.id);
        let mut playback: Option<OutputScheduler> = None;

        let exit = self.drive(&mut resources, &mut playback).await;
        resources.release(playback.as_mut()).await;
        self.meter.reset();

        match exit {
            Exit::Stopped => {
                self.apply(Trigger::Stop);
            }
            Exit::Closed(reason) => {
                log::info!(
                    "[{}] Remote closed the session: {}",
                    self.id,
                    reason.as_deref().unwrap_or("no reason")
                );
                self.apply(Trigger::Stop);
            }
            Exit::Failed(err) => {
                log::error!("[{}] Session failed: {}", self.id, err);
                self.error_tx.send_replace(Some(err));
                self.apply(Trigger::Fatal);
            }
        }
        let stats = self.stats.snapshot();
        log::info!(
            "[{}] Session ended: sent {} frames, scheduled {}/{} chunks, {} interruptions",
            self.id,
            stats.frames_sent,
            stats.chunks_scheduled,
            stats.chunks_received,
            stats.interruptions,
        );
    }

    async fn drive(
        &mut self,
        resources: &mut SessionResources,
        playback_slot: &mut Option<OutputScheduler>,
    ) -> Exit {
        // 1. 申请麦克风
        let constraints = self.config.capture_constraints();
        let backend = self.backend.clone();
        let acquire = CaptureUnit::start(backend.as_ref(), &constraints);
        let capture = match until_stopped(&mut self.commands, acquire).await {
            Some(Ok(capture)) => capture,
            Some(Err(e)) => return Exit::Failed(e),
            None => return Exit::Stopped,
        };
        resources.attach_capture(capture);

        // 2. 打开播放设备
        let rate = self.config.playback_sample_rate;
        let (ended_tx, mut ended_rx) = mpsc::unbounded_channel::<ChunkId>();
        let device = match self.backend.open_output(rate, ended_tx) {
            Ok(device) => device,
            Err(e) => return Exit::Failed(e),
        };
        let playback = playback_slot.insert(OutputScheduler::new(device, rate));

        // 3. 建立远端会话
        let session_config = self.config.session_config(&self.persona);
        let transport = self.transport.clone();
        let session = match until_stopped(&mut self.commands, transport.open(session_config)).await {
            Some(Ok(session)) => session,
            Some(Err(e)) => return Exit::Failed(PipelineError::TransportOpen(format!("{:#}", e))),
            None => return Exit::Stopped,
        };
        resources.attach_link(session.handle);
        let mut events = session.events;
        log::info!("[{}] Transport opened, waiting for remote ready", self.id);

        // 4. 主循环
        loop {
            tokio::select! {
                cmd = self.commands.recv() => {
                    match cmd {
                        Some(Command::Stop) | None => return Exit::Stopped,
                    }
                }

                event = events.recv() => {
                    let Some(event) = event else {
                        return Exit::Closed(Some("event stream ended".into()));
                    };
                    if let Some(exit) = self.on_transport_event(event, resources, playback) {
                        return exit;
                    }
                }

                Some(id) = ended_rx.recv() => {
                    if playback.on_ended(id) {
                        self.maybe_finish_turn(playback);
                    }
                }

                decoded = playback.next_decoded(), if playback.has_pending() => {
                    if let Some(exit) = decoded.and_then(|d| self.on_decoded(d, playback)) {
                        return exit;
                    }
                }
            }
        }
    }

    fn on_transport_event(
        &mut self,
        event: TransportEvent,
        resources: &mut SessionResources,
        playback: &mut OutputScheduler,
    ) -> Option<Exit> {
        match event {
            TransportEvent::Open => {
                if !self.apply(Trigger::TransportOpened) {
                    return None;
                }
                let Some(link) = resources.link() else {
                    return Some(Exit::Failed(PipelineError::TransportRuntime("no session handle".into())));
                };
                let sink = CaptureSink::new(
                    link,
                    self.meter.clone(),
                    self.config.meter_gain,
                    self.config.capture_sample_rate,
                    self.stats.clone(),
                );
                let started = match resources.capture_mut() {
                    Some(capture) => capture.begin_streaming(sink),
                    None => Err(PipelineError::DeviceUnavailable("microphone not acquired".into())),
                };
                if let Err(e) = started {
                    return Some(Exit::Failed(e));
                }
                log::info!("[{}] Streaming microphone audio", self.id);
                None
            }
            TransportEvent::Message(msg) => {
                self.on_message(msg, playback);
                None
            }
            TransportEvent::Close(reason) => Some(Exit::Closed(reason)),
            TransportEvent::Error(e) => Some(Exit::Failed(PipelineError::TransportRuntime(e))),
        }
    }

    fn on_message(&mut self, msg: ServerMessage, playback: &mut OutputScheduler) {
        if let Some(text) = &msg.text {
            log::debug!("[{}] Transcript: {}", self.id, text);
        }

        if msg.interrupted {
            self.barge_in(playback);
        }

        for frame in msg.audio {
            self.on_audio(frame, playback);
        }

        if msg.turn_complete {
            if self.state == SessionState::Speaking {
                self.turn_complete = true;
                self.maybe_finish_turn(playback);
            } else {
                log::debug!("[{}] turn complete with no audio in {}", self.id, self.state);
            }
        }
    }

    fn on_audio(&mut self, frame: EncodedFrame, playback: &mut OutputScheduler) {
        if !self.state.is_live() {
            log::debug!("[{}] dropping audio received in {}", self.id, self.state);
            return;
        }
        self.stats.chunk_received();
        // 新的音频属于新一轮回复
        self.turn_complete = false;
        self.apply(Trigger::AudioArrived);
        playback.enqueue(frame);
    }

    fn on_decoded(
        &mut self,
        decoded: Result<PlaybackChunk, PipelineError>,
        playback: &mut OutputScheduler,
    ) -> Option<Exit> {
        let result = decoded.and_then(|chunk| playback.schedule(chunk));
        match result {
            Ok(span) => {
                self.stats.chunk_scheduled();
                log::trace!("[{}] chunk {} at {:.3}s", self.id, span.id, span.start);
            }
            Err(e) if e.is_fatal() => return Some(Exit::Failed(e)),
            Err(e) => {
                self.stats.chunk_dropped();
                log::warn!("[{}] Dropping chunk: {}", self.id, e);
                self.maybe_finish_turn(playback);
            }
        }
        None
    }

    fn barge_in(&mut self, playback: &mut OutputScheduler) {
        if !self.state.is_live() {
            log::debug!("[{}] ignoring interruption in {}", self.id, self.state);
            return;
        }
        let stopped = playback.flush();
        self.stats.interrupted();
        self.turn_complete = false;
        log::info!("[{}] Interrupted, stopped {} chunks", self.id, stopped);
        self.apply(Trigger::Interrupted);
    }

    fn maybe_finish_turn(&mut self, playback: &OutputScheduler) {
        if self.state == SessionState::Speaking && self.turn_complete && playback.is_drained() {
            self.turn_complete = false;
            self.apply(Trigger::TurnDrained);
        }
    }
}

/// Awaits `fut` unless the host asks to stop first.
async fn until_stopped<F: Future>(commands: &mut mpsc::Receiver<Command>, fut: F) -> Option<F::Output> {
    tokio::select! {
        out = fut => Some(out),
        cmd = commands.recv() => {
            match cmd {
                Some(Command::Stop) | None => None,
            }
        }
    }
}
