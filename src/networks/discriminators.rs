//! Adversarial critics over raw and spectral views of the waveform

use candle_core::{Device, Module, Tensor, D};
use candle_nn::{conv1d, conv2d, Conv1d, Conv1dConfig, Conv2d, Conv2dConfig, VarBuilder};

use super::mossformer2_sr::leaky_relu;
use super::stft::Stft;

const PERIODS: [usize; 5] = [2, 3, 5, 7, 11];
const SCALES: usize = 3;
const RESOLUTIONS: [(usize, usize); 3] = [(256, 64), (512, 128), (1024, 256)];

/// Critic scoring `(batch, samples)` audio
///
/// Returns one score map per sub-discriminator; higher means "real".
pub trait Discriminator: Send + Sync {
    fn forward(&self, audio: &Tensor) -> candle_core::Result<Vec<Tensor>>;
}

/// Stack of 1-D convolutions with leaky activations and a 1-channel head
struct ConvStack {
    layers: Vec<Conv1d>,
    head: Conv1d,
}

impl ConvStack {
    fn new(specs: &[(usize, usize, usize, usize, usize)], vb: VarBuilder) -> candle_core::Result<Self> {
        let mut layers = Vec::with_capacity(specs.len());
        let mut last = 1;
        for (i, &(out, kernel, stride, groups, padding)) in specs.iter().enumerate() {
            let cfg = Conv1dConfig {
                padding,
                stride,
                groups,
                ..Default::default()
            };
            layers.push(conv1d(last, out, kernel, cfg, vb.pp(format!("conv_{}", i)))?);
            last = out;
        }
        let head_cfg = Conv1dConfig {
            padding: 1,
            ..Default::default()
        };
        let head = conv1d(last, 1, 3, head_cfg, vb.pp("head"))?;
        Ok(Self { layers, head })
    }
}

impl Module for ConvStack {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let mut ys = xs.clone();
        for layer in &self.layers {
            ys = leaky_relu(&layer.forward(&ys)?)?;
        }
        self.head.forward(&ys)
    }
}

/// Views the waveform as `period` interleaved sub-signals
pub struct MultiPeriodDiscriminator {
    periods: Vec<(usize, ConvStack)>,
}

impl MultiPeriodDiscriminator {
    pub fn new(vb: VarBuilder) -> candle_core::Result<Self> {
        let specs = [(16, 5, 3, 1, 2), (32, 5, 3, 1, 2), (32, 3, 1, 1, 1)];
        let periods = PERIODS
            .iter()
            .map(|&p| Ok((p, ConvStack::new(&specs, vb.pp(format!("period_{}", p)))?)))
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(Self { periods })
    }
}

impl Discriminator for MultiPeriodDiscriminator {
    fn forward(&self, audio: &Tensor) -> candle_core::Result<Vec<Tensor>> {
        let (batch, samples) = audio.dims2()?;
        let mut scores = Vec::with_capacity(self.periods.len());
        for (period, stack) in &self.periods {
            let remainder = samples % period;
            let padded = if remainder == 0 {
                audio.clone()
            } else {
                audio.pad_with_zeros(D::Minus1, 0, period - remainder)?
            };
            let frames = padded.dim(D::Minus1)? / period;
            // (B, frames, p) -> (B * p, 1, frames)
            let folded = padded
                .reshape((batch, frames, *period))?
                .transpose(1, 2)?
                .contiguous()?
                .reshape((batch * period, 1, frames))?;
            scores.push(stack.forward(&folded)?);
        }
        Ok(scores)
    }
}

/// Scores the waveform at full, half and quarter rate
pub struct MultiScaleDiscriminator {
    scales: Vec<ConvStack>,
}

impl MultiScaleDiscriminator {
    pub fn new(vb: VarBuilder) -> candle_core::Result<Self> {
        let specs = [(16, 15, 1, 1, 7), (32, 41, 4, 4, 20), (32, 5, 1, 1, 2)];
        let scales = (0..SCALES)
            .map(|i| ConvStack::new(&specs, vb.pp(format!("scale_{}", i))))
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(Self { scales })
    }
}

/// Halve the sample rate by averaging neighbouring samples
fn average_pool2(xs: &Tensor) -> candle_core::Result<Tensor> {
    let samples = xs.dim(D::Minus1)?;
    let xs = if samples % 2 == 1 {
        xs.pad_with_zeros(D::Minus1, 0, 1)?
    } else {
        xs.clone()
    };
    let (batch, channels, samples) = xs.dims3()?;
    xs.reshape((batch, channels, samples / 2, 2))?.mean(D::Minus1)
}

impl Discriminator for MultiScaleDiscriminator {
    fn forward(&self, audio: &Tensor) -> candle_core::Result<Vec<Tensor>> {
        let mut xs = audio.unsqueeze(1)?;
        let mut scores = Vec::with_capacity(self.scales.len());
        for (i, stack) in self.scales.iter().enumerate() {
            if i > 0 {
                xs = average_pool2(&xs)?;
            }
            scores.push(stack.forward(&xs)?);
        }
        Ok(scores)
    }
}

struct SpectrogramCritic {
    stft: Stft,
    layers: Vec<Conv2d>,
    head: Conv2d,
}

impl SpectrogramCritic {
    fn new(n_fft: usize, hop: usize, device: &Device, vb: VarBuilder) -> candle_core::Result<Self> {
        let same = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let strided = Conv2dConfig {
            padding: 1,
            stride: 2,
            ..Default::default()
        };
        Ok(Self {
            stft: Stft::new(n_fft, hop, device)?,
            layers: vec![
                conv2d(1, 16, 3, same, vb.pp("conv_0"))?,
                conv2d(16, 16, 3, strided, vb.pp("conv_1"))?,
                conv2d(16, 16, 3, same, vb.pp("conv_2"))?,
            ],
            head: conv2d(16, 1, 3, same, vb.pp("head"))?,
        })
    }

    fn forward(&self, audio: &Tensor) -> candle_core::Result<Tensor> {
        let mut ys = self.stft.magnitude(audio)?.unsqueeze(1)?;
        for layer in &self.layers {
            ys = leaky_relu(&layer.forward(&ys)?)?;
        }
        self.head.forward(&ys)
    }
}

/// Scores magnitude spectrograms at several time/frequency trade-offs
pub struct MultiResolutionDiscriminator {
    resolutions: Vec<SpectrogramCritic>,
}

impl MultiResolutionDiscriminator {
    pub fn new(device: &Device, vb: VarBuilder) -> candle_core::Result<Self> {
        let resolutions = RESOLUTIONS
            .iter()
            .map(|&(n_fft, hop)| SpectrogramCritic::new(n_fft, hop, device, vb.pp(format!("stft_{}", n_fft))))
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(Self { resolutions })
    }
}

impl Discriminator for MultiResolutionDiscriminator {
    fn forward(&self, audio: &Tensor) -> candle_core::Result<Vec<Tensor>> {
        self.resolutions.iter().map(|critic| critic.forward(audio)).collect()
    }
}
