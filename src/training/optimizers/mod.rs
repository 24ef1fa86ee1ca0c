//! Optimizers for the generator stages and the discriminators
//!
//! Every trainable variable is owned by exactly one optimizer: the waveform
//! generator, the spectral mapper, or the joint discriminator optimizer.

pub mod gradients;
pub mod schedulers;

pub use gradients::{all_reduce_mean, global_norm, FinishedStep, GradAccumulator};
pub use schedulers::ExponentialScheduler;

use std::collections::HashSet;

use candle_core::backprop::GradStore;
use candle_core::Var;
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::TrainConfig;
use crate::error::{Error, Result};
use crate::networks::NetworkBundle;

const ADAM_EPS: f64 = 1e-8;

/// Current learning rate of each optimizer
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LearningRates {
    pub generator: f64,
    pub mapper: f64,
    pub discriminator: f64,
}

/// Optimizer for one module group, with its decay schedule
pub struct GroupOptimizer {
    name: &'static str,
    optimizer: AdamW,
    scheduler: ExponentialScheduler,
    parameter_count: usize,
}

impl GroupOptimizer {
    fn new(name: &'static str, vars: Vec<Var>, lr: f64, config: &TrainConfig) -> Result<Self> {
        let parameter_count = vars.iter().map(|var| var.elem_count()).sum();
        let params = ParamsAdamW {
            lr,
            beta1: config.adam_b1,
            beta2: config.adam_b2,
            eps: ADAM_EPS,
            weight_decay: config.weight_decay,
        };
        debug!("{} optimizer: lr={:.2e}, {} parameters", name, lr, parameter_count);

        Ok(Self {
            name,
            optimizer: AdamW::new(vars, params)?,
            scheduler: ExponentialScheduler::new(lr, config.lr_decay),
            parameter_count,
        })
    }

    pub fn name(&self) -> &str {
        self.name
    }

    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        self.optimizer.step(grads)?;
        Ok(())
    }

    pub fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    pub fn parameter_count(&self) -> usize {
        self.parameter_count
    }

    fn set_decay_step(&mut self, step: usize) {
        self.scheduler.set_step(step);
        self.optimizer.set_learning_rate(self.scheduler.get_lr());
    }

    fn decay(&mut self) {
        let lr = self.scheduler.step();
        self.optimizer.set_learning_rate(lr);
    }
}

/// The three optimizers of a run
pub struct OptimizerSet {
    /// `models[1]`, learning rate `learning_rate`
    pub generator: GroupOptimizer,
    /// `models[0]`, learning rate `learning_rate_mossformer`
    pub mapper: GroupOptimizer,
    /// All discriminators jointly, learning rate `learning_rate`
    pub discriminator: GroupOptimizer,
}

impl OptimizerSet {
    pub fn new(bundle: &NetworkBundle, config: &TrainConfig) -> Result<Self> {
        let mapper_vars = bundle.mapper().vars();
        let generator_vars = bundle.generator().vars();
        let discriminator_vars: Vec<Var> = bundle.discriminators.iter().flat_map(|d| d.vars()).collect();

        ensure_disjoint(&[&mapper_vars, &generator_vars, &discriminator_vars])?;

        Ok(Self {
            generator: GroupOptimizer::new("generator", generator_vars, config.learning_rate, config)?,
            mapper: GroupOptimizer::new("mapper", mapper_vars, config.learning_rate_mossformer, config)?,
            discriminator: GroupOptimizer::new("discriminator", discriminator_vars, config.learning_rate, config)?,
        })
    }

    pub fn learning_rates(&self) -> LearningRates {
        LearningRates {
            generator: self.generator.learning_rate(),
            mapper: self.mapper.learning_rate(),
            discriminator: self.discriminator.learning_rate(),
        }
    }

    /// Apply one epoch of learning rate decay to every group
    pub fn decay(&mut self) {
        for group in self.groups_mut() {
            group.decay();
        }
    }

    /// Restore the schedules after `epochs` completed epochs
    pub fn resume_at_epoch(&mut self, epochs: usize) {
        for group in self.groups_mut() {
            group.set_decay_step(epochs);
        }
    }

    fn groups_mut(&mut self) -> [&mut GroupOptimizer; 3] {
        [&mut self.generator, &mut self.mapper, &mut self.discriminator]
    }
}

/// Fail if any variable appears in more than one group
fn ensure_disjoint(groups: &[&Vec<Var>]) -> Result<()> {
    let mut seen = HashSet::new();
    for group in groups {
        for var in group.iter() {
            if !seen.insert(var.as_tensor().id()) {
                return Err(Error::internal("a parameter is claimed by two optimizers"));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::networks::NetworkKind;
    use crate::runtime::{init_environment, DistInfo};
    use approx::assert_relative_eq;
    use candle_core::Device;

    fn config() -> TrainConfig {
        TrainConfig {
            hidden_channels: 4,
            frame_hop: 40,
            lr_decay: 0.5,
            ..TrainConfig::default()
        }
    }

    #[test]
    fn test_groups_cover_every_parameter_once() {
        let config = config();
        let ctx = init_environment(&config, &DistInfo::single()).unwrap();
        let bundle = NetworkKind::MossFormer2Sr48k.build(&ctx, &config).unwrap();
        let optimizers = OptimizerSet::new(&bundle, &config).unwrap();

        let total = optimizers.generator.parameter_count()
            + optimizers.mapper.parameter_count()
            + optimizers.discriminator.parameter_count();
        assert_eq!(total, bundle.parameter_count());

        let rates = optimizers.learning_rates();
        assert_relative_eq!(rates.generator, config.learning_rate);
        assert_relative_eq!(rates.mapper, config.learning_rate_mossformer);
        assert_relative_eq!(rates.discriminator, config.learning_rate);
    }

    #[test]
    fn test_shared_parameter_is_rejected() {
        let var = Var::new(&[1f32], &Device::Cpu).unwrap();
        let a = vec![var.clone()];
        let b = vec![var];
        assert!(ensure_disjoint(&[&a, &b]).is_err());
    }

    #[test]
    fn test_decay_and_resume() {
        let config = config();
        let ctx = init_environment(&config, &DistInfo::single()).unwrap();
        let bundle = NetworkKind::MossFormer2Sr48k.build(&ctx, &config).unwrap();
        let mut optimizers = OptimizerSet::new(&bundle, &config).unwrap();

        optimizers.decay();
        assert_relative_eq!(optimizers.learning_rates().generator, config.learning_rate * 0.5);

        optimizers.resume_at_epoch(3);
        assert_relative_eq!(optimizers.learning_rates().mapper, config.learning_rate_mossformer * 0.125);
    }
}
