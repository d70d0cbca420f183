use std::fs;
use std::path::Path;
use serde::Deserialize;

#[derive(Deserialize)]
struct Config {
    application: Application,
    capture: Capture,
    playback: Playback,
    session: Session,
}

#[derive(Deserialize)]
struct Application {
    name: String,
    version: String,
}

#[derive(Deserialize)]
struct Capture {
    device: String,
    sample_rate: u32,
    block_size: usize,
    echo_cancellation: bool,
    noise_suppression: bool,
}

#[derive(Deserialize)]
struct Playback {
    device: String,
    sample_rate: u32,
    period_size: usize,
}

#[derive(Deserialize)]
struct Session {
    voice: String,
    response_modality: String,
    event_buffer: usize,
    meter_gain: f32,
}

// 在编译时读取 config.toml 并设置环境变量
fn main() {
    println!("cargo:rerun-if-changed=config.toml");

    let config_path = Path::new("config.toml");
    if !config_path.exists() {
        panic!("config.toml not found!");
    }

    let config_str = fs::read_to_string(config_path).expect("Failed to read config.toml");
    let config: Config = toml::from_str(&config_str).expect("Failed to parse config.toml");

    if config.capture.sample_rate == 0 || config.playback.sample_rate == 0 {
        panic!("sample rates in config.toml must be non-zero");
    }
    if config.capture.block_size == 0 {
        panic!("capture.block_size must be non-zero");
    }

    // 应用信息
    println!("cargo:rustc-env=APP_NAME={}", config.application.name);
    println!("cargo:rustc-env=APP_VERSION={}", config.application.version);

    // 采集配置
    println!("cargo:rustc-env=CAPTURE_DEVICE={}", config.capture.device);
    println!("cargo:rustc-env=CAPTURE_SAMPLE_RATE={}", config.capture.sample_rate);
    println!("cargo:rustc-env=CAPTURE_BLOCK_SIZE={}", config.capture.block_size);
    println!("cargo:rustc-env=CAPTURE_ECHO_CANCELLATION={}", config.capture.echo_cancellation);
    println!("cargo:rustc-env=CAPTURE_NOISE_SUPPRESSION={}", config.capture.noise_suppression);

    // 播放配置
    println!("cargo:rustc-env=PLAYBACK_DEVICE={}", config.playback.device);
    println!("cargo:rustc-env=PLAYBACK_SAMPLE_RATE={}", config.playback.sample_rate);
    println!("cargo:rustc-env=PLAYBACK_PERIOD_SIZE={}", config.playback.period_size);

    // 会话配置
    println!("cargo:rustc-env=SESSION_VOICE={}", config.session.voice);
    println!("cargo:rustc-env=SESSION_RESPONSE_MODALITY={}", config.session.response_modality);
    println!("cargo:rustc-env=SESSION_EVENT_BUFFER={}", config.session.event_buffer);
    println!("cargo:rustc-env=SESSION_METER_GAIN={}", config.session.meter_gain);
}
