//! MossFormer2 48 kHz super-resolution stages
//!
//! The spectral mapper frames the (upsampled) low-resolution waveform with a
//! learned analysis filterbank and refines the frames with dilated residual
//! convolutions. The waveform generator turns those frames back into samples
//! with a transposed convolution whose stride equals the frame hop.

use candle_core::{Module, Tensor};
use candle_nn::{
    conv1d, conv_transpose1d, Conv1d, Conv1dConfig, ConvTranspose1d, ConvTranspose1dConfig, VarBuilder,
};

use super::discriminators::{
    Discriminator, MultiPeriodDiscriminator, MultiResolutionDiscriminator, MultiScaleDiscriminator,
};
use super::{Critic, Model, NetworkBundle, Trainable};
use crate::config::TrainConfig;
use crate::error::Result;
use crate::runtime::RunContext;

pub(super) const LRELU_SLOPE: f64 = 0.1;

const MAPPER_DILATIONS: [usize; 4] = [1, 2, 4, 8];
const GENERATOR_DILATIONS: [usize; 3] = [1, 3, 9];

pub(super) fn leaky_relu(xs: &Tensor) -> candle_core::Result<Tensor> {
    xs.maximum(&(xs * LRELU_SLOPE)?)
}

pub(super) fn build(ctx: &RunContext, config: &TrainConfig) -> Result<NetworkBundle> {
    let channels = config.hidden_channels;
    let hop = config.frame_hop;

    let mapper = Model::new("spectral_mapper", ctx, |vb| {
        Ok(Box::new(SpectralMapper::new(channels, hop, vb)?) as Box<dyn Module + Send + Sync>)
    })?;
    let generator = Model::new("wave_generator", ctx, |vb| {
        Ok(Box::new(WaveGenerator::new(channels, hop, vb)?) as Box<dyn Module + Send + Sync>)
    })?;

    let discriminators: Vec<Critic> = vec![
        Trainable::new("mpd", ctx, |vb| {
            Ok(Box::new(MultiPeriodDiscriminator::new(vb)?) as Box<dyn Discriminator>)
        })?,
        Trainable::new("msd", ctx, |vb| {
            Ok(Box::new(MultiScaleDiscriminator::new(vb)?) as Box<dyn Discriminator>)
        })?,
        Trainable::new("mrd", ctx, |vb| {
            Ok(Box::new(MultiResolutionDiscriminator::new(&ctx.device, vb)?) as Box<dyn Discriminator>)
        })?,
    ];

    Ok(NetworkBundle {
        models: vec![mapper, generator],
        discriminators,
        frame_hop: hop,
    })
}

/// Dilated convolution with a pointwise projection and identity skip
struct ResidualBlock {
    dilated: Conv1d,
    pointwise: Conv1d,
}

impl ResidualBlock {
    fn new(channels: usize, dilation: usize, vb: VarBuilder) -> candle_core::Result<Self> {
        let dilated_cfg = Conv1dConfig {
            padding: dilation,
            dilation,
            ..Default::default()
        };
        Ok(Self {
            dilated: conv1d(channels, channels, 3, dilated_cfg, vb.pp("dilated"))?,
            pointwise: conv1d(channels, channels, 1, Default::default(), vb.pp("pointwise"))?,
        })
    }
}

impl Module for ResidualBlock {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let ys = self.dilated.forward(&leaky_relu(xs)?)?;
        let ys = self.pointwise.forward(&leaky_relu(&ys)?)?;
        xs + ys
    }
}

/// `(batch, 1, samples)` to `(batch, channels, samples / hop)`
pub struct SpectralMapper {
    analysis: Conv1d,
    blocks: Vec<ResidualBlock>,
    projection: Conv1d,
}

impl SpectralMapper {
    pub fn new(channels: usize, hop: usize, vb: VarBuilder) -> candle_core::Result<Self> {
        let analysis_cfg = Conv1dConfig {
            stride: hop,
            ..Default::default()
        };
        let blocks = MAPPER_DILATIONS
            .iter()
            .enumerate()
            .map(|(i, &dilation)| ResidualBlock::new(channels, dilation, vb.pp(format!("block_{}", i))))
            .collect::<candle_core::Result<Vec<_>>>()?;

        Ok(Self {
            analysis: conv1d(1, channels, hop, analysis_cfg, vb.pp("analysis"))?,
            blocks,
            projection: conv1d(channels, channels, 1, Default::default(), vb.pp("projection"))?,
        })
    }
}

impl Module for SpectralMapper {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let mut ys = self.analysis.forward(xs)?;
        for block in &self.blocks {
            ys = block.forward(&ys)?;
        }
        self.projection.forward(&leaky_relu(&ys)?)
    }
}

/// `(batch, channels, frames)` to `(batch, 1, frames * hop)` in `[-1, 1]`
pub struct WaveGenerator {
    pre: Conv1d,
    upsample: ConvTranspose1d,
    blocks: Vec<ResidualBlock>,
    post: Conv1d,
}

impl WaveGenerator {
    pub fn new(channels: usize, hop: usize, vb: VarBuilder) -> candle_core::Result<Self> {
        let inner = (channels / 2).max(1);
        let same7 = Conv1dConfig {
            padding: 3,
            ..Default::default()
        };
        let upsample_cfg = ConvTranspose1dConfig {
            stride: hop,
            ..Default::default()
        };
        let blocks = GENERATOR_DILATIONS
            .iter()
            .enumerate()
            .map(|(i, &dilation)| ResidualBlock::new(inner, dilation, vb.pp(format!("block_{}", i))))
            .collect::<candle_core::Result<Vec<_>>>()?;

        Ok(Self {
            pre: conv1d(channels, channels, 7, same7, vb.pp("pre"))?,
            upsample: conv_transpose1d(channels, inner, hop, upsample_cfg, vb.pp("upsample"))?,
            blocks,
            post: conv1d(inner, 1, 7, same7, vb.pp("post"))?,
        })
    }
}

impl Module for WaveGenerator {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let ys = self.pre.forward(xs)?;
        let mut ys = self.upsample.forward(&leaky_relu(&ys)?)?;
        for block in &self.blocks {
            ys = block.forward(&ys)?;
        }
        self.post.forward(&leaky_relu(&ys)?)?.tanh()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_mapper_and_generator_shapes() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let mapper = SpectralMapper::new(8, 20, vb.pp("mapper")).unwrap();
        let generator = WaveGenerator::new(8, 20, vb.pp("generator")).unwrap();

        let audio = Tensor::zeros((3, 1, 200), DType::F32, &Device::Cpu).unwrap();
        let latent = mapper.forward(&audio).unwrap();
        assert_eq!(latent.dims(), &[3, 8, 10]);

        let output = generator.forward(&latent).unwrap();
        assert_eq!(output.dims(), &[3, 1, 200]);
        let peak = output.abs().unwrap().max_all().unwrap().to_scalar::<f32>().unwrap();
        assert!(peak <= 1.0);
    }
}
