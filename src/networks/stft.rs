//! Short-time Fourier transform as a fixed convolution
//!
//! The Hann-windowed DFT basis is stored as a `(2 * bins, 1, n_fft)` kernel so
//! the transform runs on any device and stays differentiable.

use std::f64::consts::PI;

use candle_core::{Device, Tensor, D};

const MAGNITUDE_FLOOR: f64 = 1e-7;

/// Resolutions used by the log-spectral reconstruction loss
pub const LOSS_RESOLUTIONS: [(usize, usize); 3] = [(512, 128), (1024, 256), (2048, 512)];

#[derive(Debug, Clone)]
pub struct Stft {
    n_fft: usize,
    hop: usize,
    bins: usize,
    kernel: Tensor,
}

impl Stft {
    pub fn new(n_fft: usize, hop: usize, device: &Device) -> candle_core::Result<Self> {
        let bins = n_fft / 2 + 1;
        let mut basis = Vec::with_capacity(2 * bins * n_fft);
        for part in 0..2 {
            for k in 0..bins {
                for n in 0..n_fft {
                    let window = 0.5 - 0.5 * (2.0 * PI * n as f64 / n_fft as f64).cos();
                    let phase = 2.0 * PI * (k * n) as f64 / n_fft as f64;
                    let value = if part == 0 { phase.cos() } else { -phase.sin() };
                    basis.push((window * value) as f32);
                }
            }
        }
        let kernel = Tensor::from_vec(basis, (2 * bins, 1, n_fft), device)?;
        Ok(Self {
            n_fft,
            hop,
            bins,
            kernel,
        })
    }

    pub fn bins(&self) -> usize {
        self.bins
    }

    /// `(batch, samples)` to `(batch, bins, frames)`, centred frames
    pub fn magnitude(&self, audio: &Tensor) -> candle_core::Result<Tensor> {
        let half = self.n_fft / 2;
        let framed = audio
            .unsqueeze(1)?
            .pad_with_zeros(D::Minus1, half, half)?
            .conv1d(&self.kernel.to_dtype(audio.dtype())?, 0, self.hop, 1, 1)?;
        let real = framed.narrow(1, 0, self.bins)?;
        let imag = framed.narrow(1, self.bins, self.bins)?;
        ((real.sqr()? + imag.sqr()?)? + MAGNITUDE_FLOOR)?.sqrt()
    }
}

/// Mean absolute log-magnitude difference averaged over resolutions
pub fn log_spectral_l1(stfts: &[Stft], predicted: &Tensor, target: &Tensor) -> candle_core::Result<Tensor> {
    let mut total: Option<Tensor> = None;
    for stft in stfts {
        let p = stft.magnitude(predicted)?.log()?;
        let t = stft.magnitude(target)?.log()?;
        let term = (p - t)?.abs()?.mean_all()?;
        total = Some(match total {
            Some(acc) => (acc + term)?,
            None => term,
        });
    }
    match total {
        Some(sum) => sum / stfts.len() as f64,
        None => Tensor::new(0f32, predicted.device()),
    }
}

/// Analysis transforms for [`log_spectral_l1`]
pub fn loss_transforms(device: &Device) -> candle_core::Result<Vec<Stft>> {
    LOSS_RESOLUTIONS
        .iter()
        .map(|&(n_fft, hop)| Stft::new(n_fft, hop, device))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_pure_tone_peaks_at_its_bin() {
        let n_fft = 64;
        let stft = Stft::new(n_fft, 16, &Device::Cpu).unwrap();
        let bin = 8;
        let tone: Vec<f32> = (0..512)
            .map(|n| (2.0 * PI * bin as f64 * n as f64 / n_fft as f64).sin() as f32)
            .collect();
        let audio = Tensor::from_vec(tone, (1, 512), &Device::Cpu).unwrap();

        let magnitude = stft.magnitude(&audio).unwrap();
        assert_eq!(magnitude.dims(), &[1, stft.bins(), 512 / 16 + 1]);

        let middle = magnitude.narrow(2, 16, 1).unwrap().flatten_all().unwrap();
        let peak = middle.argmax(0).unwrap().to_scalar::<u32>().unwrap();
        assert_eq!(peak as usize, bin);
    }

    #[test]
    fn test_identical_signals_have_zero_loss() {
        let stfts = vec![Stft::new(64, 16, &Device::Cpu).unwrap()];
        let audio = Tensor::randn(0f32, 0.3, (2, 256), &Device::Cpu).unwrap();
        let loss = log_spectral_l1(&stfts, &audio, &audio).unwrap();
        assert_relative_eq!(loss.to_scalar::<f32>().unwrap(), 0.0);
    }
}
