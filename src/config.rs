use crate::audio::capture::CaptureConstraints;
use crate::protocol::SessionConfig;

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    // 应用信息
    pub app_name: &'static str,
    pub app_version: &'static str,

    // 麦克风采集配置
    pub capture_device: String,
    pub capture_sample_rate: u32,
    pub capture_block_size: usize,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,

    // 播放配置
    pub playback_device: String,
    pub playback_sample_rate: u32,
    pub playback_period_size: usize,

    // 会话参数
    pub voice: String,
    pub response_modality: String,
    pub event_buffer: usize,
    pub meter_gain: f32,
}

impl Config {
    /// 从编译时设置的环境变量创建配置
    /// 所有参数都在编译时从 config.toml 中读取
    pub fn new() -> Result<Self, &'static str> {
        Ok(Self {
            app_name: env!("APP_NAME"),
            app_version: env!("APP_VERSION"),

            capture_device: env!("CAPTURE_DEVICE").to_string(),
            capture_sample_rate: env!("CAPTURE_SAMPLE_RATE").parse()
                .map_err(|_| "Failed to parse CAPTURE_SAMPLE_RATE")?,
            capture_block_size: env!("CAPTURE_BLOCK_SIZE").parse()
                .map_err(|_| "Failed to parse CAPTURE_BLOCK_SIZE")?,
            echo_cancellation: env!("CAPTURE_ECHO_CANCELLATION").parse()
                .map_err(|_| "Failed to parse CAPTURE_ECHO_CANCELLATION")?,
            noise_suppression: env!("CAPTURE_NOISE_SUPPRESSION").parse()
                .map_err(|_| "Failed to parse CAPTURE_NOISE_SUPPRESSION")?,

            playback_device: env!("PLAYBACK_DEVICE").to_string(),
            playback_sample_rate: env!("PLAYBACK_SAMPLE_RATE").parse()
                .map_err(|_| "Failed to parse PLAYBACK_SAMPLE_RATE")?,
            playback_period_size: env!("PLAYBACK_PERIOD_SIZE").parse()
                .map_err(|_| "Failed to parse PLAYBACK_PERIOD_SIZE")?,

            voice: env!("SESSION_VOICE").to_string(),
            response_modality: env!("SESSION_RESPONSE_MODALITY").to_string(),
            event_buffer: env!("SESSION_EVENT_BUFFER").parse()
                .map_err(|_| "Failed to parse SESSION_EVENT_BUFFER")?,
            meter_gain: env!("SESSION_METER_GAIN").parse()
                .map_err(|_| "Failed to parse SESSION_METER_GAIN")?,
        })
    }

    /// Microphone request derived from the capture section.
    pub fn capture_constraints(&self) -> CaptureConstraints {
        CaptureConstraints {
            sample_rate: self.capture_sample_rate,
            block_size: self.capture_block_size,
            channels: 1,
            echo_cancellation: self.echo_cancellation,
            noise_suppression: self.noise_suppression,
        }
    }

    /// Builds what `Transport::open` receives. `persona` is the host's
    /// natural-language context (profile, assistant persona).
    pub fn session_config(&self, persona: &str) -> SessionConfig {
        SessionConfig::new(
            &self.response_modality,
            &self.voice,
            persona,
            self.capture_sample_rate,
            self.playback_sample_rate,
        )
    }
}
