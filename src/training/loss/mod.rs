//! Training objectives for adversarial speech super-resolution
//!
//! - **adversarial**: least-squares GAN losses for critics and generator
//! - **ReconstructionLoss**: waveform L1 plus multi-resolution log-spectral L1

pub mod adversarial;

pub use adversarial::{discriminator_loss, generator_loss};

use candle_core::{Device, Tensor};

use crate::config::TrainConfig;
use crate::error::Result;
use crate::networks::stft::{log_spectral_l1, loss_transforms, Stft};

/// Reconstruction terms between generated and reference audio
pub struct ReconstructionLoss {
    stfts: Vec<Stft>,
}

/// Scalar reconstruction terms, still attached to the graph
pub struct ReconstructionTerms {
    pub wave: Tensor,
    pub spectral: Tensor,
}

impl ReconstructionTerms {
    pub fn sum(&self) -> Result<Tensor> {
        Ok((&self.wave + &self.spectral)?)
    }
}

impl ReconstructionLoss {
    pub fn new(device: &Device) -> Result<Self> {
        Ok(Self {
            stfts: loss_transforms(device)?,
        })
    }

    pub fn forward(&self, predicted: &Tensor, target: &Tensor) -> Result<ReconstructionTerms> {
        Ok(ReconstructionTerms {
            wave: (predicted - target)?.abs()?.mean_all()?,
            spectral: log_spectral_l1(&self.stfts, predicted, target)?,
        })
    }
}

/// Weights of the generator objective
#[derive(Debug, Clone, Copy)]
pub struct LossWeights {
    pub adversarial: f64,
    pub reconstruction: f64,
}

impl LossWeights {
    pub fn from_config(config: &TrainConfig) -> Self {
        Self {
            adversarial: config.lambda_adv,
            reconstruction: config.lambda_wave,
        }
    }

    /// `adversarial * adv + reconstruction * (wave + spectral)`
    pub fn generator_objective(&self, adversarial: &Tensor, reconstruction: &ReconstructionTerms) -> Result<Tensor> {
        let adv = (adversarial * self.adversarial)?;
        let rec = (reconstruction.sum()? * self.reconstruction)?;
        Ok((adv + rec)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_reconstruction_of_identical_audio_is_zero() {
        let loss = ReconstructionLoss::new(&Device::Cpu).unwrap();
        let audio = Tensor::randn(0f32, 0.2, (1, 4096), &Device::Cpu).unwrap();
        let terms = loss.forward(&audio, &audio).unwrap();
        assert_relative_eq!(terms.sum().unwrap().to_scalar::<f32>().unwrap(), 0.0);
    }

    #[test]
    fn test_generator_objective_weighting() {
        let weights = LossWeights {
            adversarial: 2.0,
            reconstruction: 10.0,
        };
        let scalar = |v: f32| Tensor::new(v, &Device::Cpu).unwrap();
        let terms = ReconstructionTerms {
            wave: scalar(0.5),
            spectral: scalar(0.25),
        };
        let total = weights.generator_objective(&scalar(1.0), &terms).unwrap();
        assert_relative_eq!(total.to_scalar::<f32>().unwrap(), 9.5);
    }
}
