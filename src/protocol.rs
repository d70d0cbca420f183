//! Wire shapes exchanged with the conversational endpoint.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

const PCM_MIME_PREFIX: &str = "audio/pcm";

/// Audio payload with its encoding descriptor, base64 packaged.
///
/// Outbound microphone frames and inbound reply chunks use the same envelope.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EncodedFrame {
    pub mime_type: String,
    pub data: String,
}

impl EncodedFrame {
    /// Wraps little-endian PCM16 bytes.
    pub fn pcm16(bytes: &[u8], sample_rate: u32) -> Self {
        Self {
            mime_type: pcm_mime_type(sample_rate),
            data: STANDARD.encode(bytes),
        }
    }

    /// `rate=` parameter of the mime type, if present.
    pub fn sample_rate(&self) -> Option<u32> {
        self.mime_type
            .split(';')
            .skip(1)
            .filter_map(|param| param.trim().strip_prefix("rate="))
            .find_map(|rate| rate.parse().ok())
    }

    pub fn is_pcm(&self) -> bool {
        self.mime_type
            .split(';')
            .next()
            .is_some_and(|base| base.trim().eq_ignore_ascii_case(PCM_MIME_PREFIX))
    }

    /// Raw payload bytes.
    pub fn payload(&self) -> Result<Vec<u8>, PipelineError> {
        STANDARD
            .decode(self.data.as_bytes())
            .map_err(|e| PipelineError::Decode(format!("bad base64 payload: {}", e)))
    }
}

pub fn pcm_mime_type(sample_rate: u32) -> String {
    format!("{};rate={}", PCM_MIME_PREFIX, sample_rate)
}

/// One inbound message from the endpoint. Any combination of fields may be set.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub audio: Vec<EncodedFrame>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default)]
    pub turn_complete: bool,
    #[serde(default)]
    pub interrupted: bool,
}

impl ServerMessage {
    pub fn audio(frame: EncodedFrame) -> Self {
        Self {
            audio: vec![frame],
            ..Default::default()
        }
    }

    pub fn turn_complete() -> Self {
        Self {
            turn_complete: true,
            ..Default::default()
        }
    }

    pub fn interrupted() -> Self {
        Self {
            interrupted: true,
            ..Default::default()
        }
    }

    /// For transports that receive JSON text frames.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Audio format advertised to the endpoint.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AudioFormat {
    pub mime_type: String,
}

/// What the transport needs to open a session.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    pub response_modalities: Vec<String>,
    pub voice_name: String,
    pub system_instruction: String,
    pub input_audio: AudioFormat,
    pub output_audio: AudioFormat,
}

impl SessionConfig {
    pub fn new(
        modality: &str,
        voice: &str,
        context: &str,
        capture_rate: u32,
        playback_rate: u32,
    ) -> Self {
        Self {
            response_modalities: vec![modality.to_string()],
            voice_name: voice.to_string(),
            system_instruction: context.to_string(),
            input_audio: AudioFormat {
                mime_type: pcm_mime_type(capture_rate),
            },
            output_audio: AudioFormat {
                mime_type: pcm_mime_type(playback_rate),
            },
        }
    }
}
