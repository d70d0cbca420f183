//! PCM16 framing for the endpoint: float capture blocks out, little-endian
//! PCM16 reply chunks in.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::PipelineError;
use crate::protocol::EncodedFrame;

/// Clamps to [-1, 1] and scales asymmetrically: negatives by 32768,
/// non-negatives by 32767.
pub fn f32_to_pcm16(sample: f32) -> i16 {
    let s = sample.clamp(-1.0, 1.0);
    if s < 0.0 {
        (s * 32768.0).round() as i16
    } else {
        (s * 32767.0).round() as i16
    }
}

pub fn pcm16_to_f32(sample: i16) -> f32 {
    sample as f32 / 32768.0
}

/// One capture tick of mono PCM16 at the capture rate.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub sample_rate: u32,
    pub samples: Vec<i16>,
}

impl AudioFrame {
    pub fn from_f32(block: &[f32], sample_rate: u32) -> Self {
        Self {
            sample_rate,
            samples: block.iter().copied().map(f32_to_pcm16).collect(),
        }
    }

    pub fn to_le_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.samples.len() * 2);
        for &s in &self.samples {
            buf.put_i16_le(s);
        }
        buf.freeze()
    }

    pub fn encode(&self) -> EncodedFrame {
        EncodedFrame::pcm16(&self.to_le_bytes(), self.sample_rate)
    }
}

/// Decoded reply audio, normalized floats at the playback rate.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackChunk {
    pub sample_rate: u32,
    pub samples: Vec<f32>,
}

impl PlaybackChunk {
    pub fn from_pcm16_le(bytes: &[u8], sample_rate: u32) -> Result<Self, PipelineError> {
        if bytes.len() % 2 != 0 {
            return Err(PipelineError::Decode(format!(
                "odd PCM16 payload length: {} bytes",
                bytes.len()
            )));
        }
        let mut buf = bytes;
        let mut samples = Vec::with_capacity(bytes.len() / 2);
        while buf.has_remaining() {
            samples.push(pcm16_to_f32(buf.get_i16_le()));
        }
        Ok(Self {
            sample_rate,
            samples,
        })
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Seconds.
    pub fn duration(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversion_is_asymmetric_around_zero() {
        assert_eq!(f32_to_pcm16(-1.0), -32768);
        assert_eq!(f32_to_pcm16(1.0), 32767);
        assert_eq!(f32_to_pcm16(0.0), 0);
        assert_eq!(f32_to_pcm16(-0.5), -16384);
        // 0.5 * 32767 = 16383.5
        assert_eq!(f32_to_pcm16(0.5), 16384);
        assert_eq!(f32_to_pcm16(0.25), (0.25f32 * 32767.0).round() as i16);
        assert_eq!(f32_to_pcm16(-0.25), -8192);
    }

    #[test]
    fn conversion_clamps() {
        assert_eq!(f32_to_pcm16(3.0), 32767);
        assert_eq!(f32_to_pcm16(-3.0), -32768);
    }

    #[test]
    fn frame_packs_little_endian() {
        let frame = AudioFrame::from_f32(&[1.0, -1.0, 0.0], 16000);
        assert_eq!(frame.samples, vec![32767, -32768, 0]);
        assert_eq!(&frame.to_le_bytes()[..], &[0xff, 0x7f, 0x00, 0x80, 0x00, 0x00]);

        let encoded = frame.encode();
        assert_eq!(encoded.mime_type, "audio/pcm;rate=16000");
        assert_eq!(encoded.payload().unwrap(), frame.to_le_bytes().to_vec());
    }

    #[test]
    fn playback_decode_divides_by_32768() {
        let chunk = PlaybackChunk::from_pcm16_le(&[0x00, 0x80, 0x00, 0x40, 0xff, 0x7f], 24000).unwrap();
        assert_eq!(chunk.samples[0], -1.0);
        assert_eq!(chunk.samples[1], 0.5);
        assert_eq!(chunk.samples[2], 32767.0 / 32768.0);
    }

    #[test]
    fn duration_uses_playback_rate() {
        let chunk = PlaybackChunk::from_pcm16_le(&vec![0u8; 24000], 24000).unwrap();
        assert_eq!(chunk.len(), 12000);
        assert_eq!(chunk.duration(), 0.5);
    }

    #[test]
    fn odd_length_is_rejected() {
        let err = PlaybackChunk::from_pcm16_le(&[0x00, 0x01, 0x02], 24000).unwrap_err();
        assert!(matches!(err, PipelineError::Decode(_)));
    }
}
