//! WAV I/O and bandwidth degradation

use std::path::Path;

use hound::{SampleFormat, WavReader, WavSpec, WavWriter};

use crate::error::{Error, Result};

/// Decode a WAV file to mono `f32` at `target_rate`
pub fn read_wav(path: &Path, target_rate: u32) -> Result<Vec<f32>> {
    let mut reader = WavReader::open(path)
        .map_err(|e| Error::audio(format!("cannot open {}: {}", path.display(), e)))?;
    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;

    let interleaved: Vec<f32> = match spec.sample_format {
        SampleFormat::Float => reader.samples::<f32>().collect::<std::result::Result<_, _>>()?,
        SampleFormat::Int => {
            let scale = 1.0 / (1u64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 * scale))
                .collect::<std::result::Result<_, _>>()?
        }
    };

    let mono = if channels == 1 {
        interleaved
    } else {
        interleaved
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
            .collect()
    };

    Ok(resample_linear(&mono, spec.sample_rate, target_rate))
}

/// Write mono `f32` samples as a 32-bit float WAV file
pub fn write_wav(path: &Path, samples: &[f32], sample_rate: u32) -> Result<()> {
    let spec = WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 32,
        sample_format: SampleFormat::Float,
    };
    let mut writer = WavWriter::create(path, spec)?;
    for &sample in samples {
        writer.write_sample(sample)?;
    }
    writer.finalize()?;
    Ok(())
}

/// Linear-interpolation resampling
pub fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }
    let out_len = ((samples.len() as u64 * to_rate as u64).div_ceil(from_rate as u64)) as usize;
    resample_to_len(samples, from_rate as f64 / to_rate as f64, out_len)
}

fn resample_to_len(samples: &[f32], step: f64, out_len: usize) -> Vec<f32> {
    let last = samples.len().saturating_sub(1);
    (0..out_len)
        .map(|i| {
            let pos = i as f64 * step;
            let idx = (pos.floor() as usize).min(last);
            let next = (idx + 1).min(last);
            let frac = (pos - idx as f64).clamp(0.0, 1.0) as f32;
            samples[idx] + (samples[next] - samples[idx]) * frac
        })
        .collect()
}

/// Centred moving average over `window` samples
fn box_lowpass(samples: &[f32], window: usize) -> Vec<f32> {
    if window <= 1 {
        return samples.to_vec();
    }
    let mut prefix = Vec::with_capacity(samples.len() + 1);
    prefix.push(0.0f64);
    for &s in samples {
        let last = prefix[prefix.len() - 1];
        prefix.push(last + s as f64);
    }
    let half = window / 2;
    (0..samples.len())
        .map(|i| {
            let lo = i.saturating_sub(half);
            let hi = (i + window - half).min(samples.len());
            ((prefix[hi] - prefix[lo]) / (hi - lo) as f64) as f32
        })
        .collect()
}

/// Simulate a recording made at `low_rate`, returned at `full_rate` with the
/// original length
pub fn degrade(samples: &[f32], full_rate: u32, low_rate: u32) -> Vec<f32> {
    if low_rate >= full_rate || samples.is_empty() {
        return samples.to_vec();
    }
    let ratio = full_rate as f64 / low_rate as f64;
    let smoothed = box_lowpass(samples, ratio.round() as usize);
    let decimated = resample_linear(&smoothed, full_rate, low_rate);
    resample_to_len(&decimated, 1.0 / ratio, samples.len())
}
