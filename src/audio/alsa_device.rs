//! ALSA PCM handles for the microphone and the speaker, both mono f32.

use alsa::pcm::{Access, Format, HwParams, PCM};
use alsa::{Direction, ValueOr};
use anyhow::{Context, Result};

/// What the hardware agreed to.
#[derive(Debug, Clone, Copy)]
pub struct Negotiated {
    pub sample_rate: u32,
    /// Frames per period.
    pub period_size: usize,
}

pub fn open_microphone(device: &str, sample_rate: u32, channels: u32) -> Result<(PCM, Negotiated)> {
    open_mono(device, Direction::Capture, sample_rate, channels, None)
}

pub fn open_speaker(device: &str, sample_rate: u32, period_size: usize) -> Result<(PCM, Negotiated)> {
    let period = (period_size > 0).then_some(period_size);
    open_mono(device, Direction::Playback, sample_rate, 1, period)
}

fn open_mono(
    device: &str,
    direction: Direction,
    sample_rate: u32,
    channels: u32,
    period_size: Option<usize>,
) -> Result<(PCM, Negotiated)> {
    let label = match direction {
        Direction::Capture => "capture",
        Direction::Playback => "playback",
    };
    let pcm = PCM::new(device, direction, false)
        .with_context(|| format!("open '{}' for {}", device, label))?;

    {
        let hwp = HwParams::any(&pcm).context("HwParams::any")?;
        hwp.set_access(Access::RWInterleaved)?;
        hwp.set_format(Format::FloatLE)?;
        hwp.set_channels(channels)?;
        // 采样率必须精确匹配，否则上游时间轴会漂移
        hwp.set_rate(sample_rate, ValueOr::Nearest)
            .with_context(|| format!("{} does not support {} Hz", device, sample_rate))?;
        if let Some(ps) = period_size {
            hwp.set_period_size_near(ps as alsa::pcm::Frames, ValueOr::Nearest)?;
        }
        pcm.hw_params(&hwp)?;
    }

    let negotiated = {
        let hwp = pcm.hw_params_current()?;
        Negotiated {
            sample_rate: hwp.get_rate()?,
            period_size: hwp.get_period_size()? as usize,
        }
    };

    log::info!(
        "ALSA {}: device={}, rate={}, channels={}, period={}",
        label,
        device,
        negotiated.sample_rate,
        channels,
        negotiated.period_size,
    );
    Ok((pcm, negotiated))
}
