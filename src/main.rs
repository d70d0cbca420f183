use std::sync::Arc;

use tokio::signal;
use voice_loop::audio::meter;
use voice_loop::audio::pcm::{PlaybackChunk, f32_to_pcm16};
use voice_loop::audio::resample::resample;
use voice_loop::{AlsaBackend, Config, LoopbackTransport, RemoteEnd, SessionState, VoiceSession};

const DEFAULT_PERSONA: &str = "You are a helpful voice assistant. Keep answers short.";
/// Blocks quieter than this are not echoed back.
const SPEECH_RMS: f32 = 0.02;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    env_logger::init();

    // 加载配置
    let config = Config::new().map_err(anyhow::Error::msg)?;
    log::info!("{} v{}", config.app_name, config.app_version);

    let persona = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_PERSONA.to_string());

    let backend = AlsaBackend::new(
        &config.capture_device,
        &config.playback_device,
        config.playback_period_size,
    );
    let (transport, remote) = LoopbackTransport::new(config.event_buffer);
    let capture_rate = config.capture_sample_rate;
    let playback_rate = config.playback_sample_rate;

    let mut session = VoiceSession::new(config, persona, Arc::new(transport), Arc::new(backend));
    log::info!("Session {}", session.id());
    session.start()?;

    // 回环模式：把说话内容原样播回来
    let echo = tokio::spawn(echo_remote(remote, capture_rate, playback_rate));

    let mut states = session.watch_state();
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                log::info!("Ctrl-C received, stopping");
                break;
            }
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *states.borrow_and_update();
                log::info!("State: {} (level {:.2})", state, session.level());
                if state.is_terminal() {
                    break;
                }
            }
        }
    }

    session.stop().await;
    echo.abort();

    let stats = session.stats();
    log::info!("Final state {}, {:?}", session.state(), stats);
    if session.state() == SessionState::Error {
        if let Some(err) = session.last_error() {
            anyhow::bail!("session failed: {}", err);
        }
    }
    Ok(())
}

/// Plays the endpoint: accepts the session, then sends every spoken utterance
/// back as one reply turn at the playback rate.
async fn echo_remote(mut remote: RemoteEnd, capture_rate: u32, playback_rate: u32) -> anyhow::Result<()> {
    remote.accept().await?;
    let chunk_len = (playback_rate / 2) as usize;
    let mut utterance: Vec<f32> = Vec::new();

    while let Some(frame) = remote.next_frame().await {
        let bytes = match frame.payload() {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!("Echo: bad frame: {}", e);
                continue;
            }
        };
        let block = match PlaybackChunk::from_pcm16_le(&bytes, capture_rate) {
            Ok(chunk) => chunk.samples,
            Err(e) => {
                log::warn!("Echo: bad frame: {}", e);
                continue;
            }
        };

        if meter::rms(&block) >= SPEECH_RMS {
            utterance.extend_from_slice(&block);
            continue;
        }
        if utterance.is_empty() {
            continue;
        }

        // 一句话结束，分块回放
        let reply: Vec<i16> = resample(&utterance, capture_rate, playback_rate)
            .into_iter()
            .map(f32_to_pcm16)
            .collect();
        utterance.clear();
        log::debug!("Echo: replying with {} samples", reply.len());
        remote
            .send(voice_loop::ServerMessage {
                text: Some("(echo)".into()),
                ..Default::default()
            })
            .await?;
        for chunk in reply.chunks(chunk_len) {
            remote.send_audio(chunk, playback_rate).await?;
        }
        remote.turn_complete().await?;
    }
    Ok(())
}
