//! Mono rate conversion between the capture and playback rates.
//!
//! With `high-quality-audio` the sinc resampler from `rubato` is used; if it
//! cannot be built or fails, and always without the feature, a linear
//! interpolator takes over.

#[cfg(feature = "high-quality-audio")]
use anyhow::anyhow;
#[cfg(feature = "high-quality-audio")]
use rubato::{InterpolationParameters, InterpolationType, Resampler, SincFixedIn, WindowFunction};
#[cfg(feature = "high-quality-audio")]
use std::sync::atomic::{AtomicBool, Ordering};

#[cfg(feature = "high-quality-audio")]
static FALLBACK_WARNED: AtomicBool = AtomicBool::new(false);

#[cfg(feature = "high-quality-audio")]
const SINC_CHUNK: usize = 256;

/// Converts `input` from `from` Hz to `to` Hz. Output length is
/// `round(len * to / from)`.
pub fn resample(input: &[f32], from: u32, to: u32) -> Vec<f32> {
    if from == 0 || to == 0 || from == to || input.is_empty() {
        return input.to_vec();
    }

    #[cfg(feature = "high-quality-audio")]
    {
        match resample_sinc(input, from, to) {
            Ok(out) => return out,
            Err(e) => {
                if !FALLBACK_WARNED.swap(true, Ordering::AcqRel) {
                    log::warn!("sinc resampler failed ({:#}); using linear interpolation", e);
                }
            }
        }
    }

    resample_linear(input, from, to)
}

fn expected_len(len: usize, from: u32, to: u32) -> usize {
    (len as f64 * to as f64 / from as f64).round() as usize
}

#[cfg(feature = "high-quality-audio")]
fn resample_sinc(input: &[f32], from: u32, to: u32) -> anyhow::Result<Vec<f32>> {
    let ratio = to as f64 / from as f64;
    let params = InterpolationParameters {
        sinc_len: 64,
        f_cutoff: 0.90,
        interpolation: InterpolationType::Cubic,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };
    let mut rs = SincFixedIn::<f32>::new(ratio, 2.0, params, SINC_CHUNK, 1)
        .map_err(|e| anyhow!("failed to build sinc resampler: {e:?}"))?;

    let expect = expected_len(input.len(), from, to);
    let mut out = Vec::with_capacity(expect + SINC_CHUNK);
    let mut seg = vec![0.0f32; SINC_CHUNK];
    for piece in input.chunks(SINC_CHUNK) {
        // 最后一段用末尾样本补齐
        let pad = piece.last().copied().unwrap_or(0.0);
        seg.fill(pad);
        seg[..piece.len()].copy_from_slice(piece);
        let produced = rs
            .process(std::slice::from_ref(&seg), None)
            .map_err(|e| anyhow!("resampler process failed: {e:?}"))?;
        out.extend_from_slice(&produced[0]);
    }

    let last = out.last().copied().unwrap_or(0.0);
    out.resize(expect, last);
    Ok(out)
}

/// Plain linear interpolation; fine for short speech snippets.
pub fn resample_linear(input: &[f32], from: u32, to: u32) -> Vec<f32> {
    if input.is_empty() {
        return Vec::new();
    }
    let step = from as f64 / to as f64;
    let last = input.len() - 1;
    (0..expected_len(input.len(), from, to))
        .map(|i| {
            let pos = i as f64 * step;
            let idx = (pos as usize).min(last);
            let next = (idx + 1).min(last);
            let frac = (pos - idx as f64) as f32;
            input[idx] + (input[next] - input[idx]) * frac
        })
        .collect()
}
