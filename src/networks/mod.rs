//! Network registry
//!
//! Maps network identifiers to the modules a run trains: two generator
//! stages (`models`) and a set of adversarial critics (`discriminators`).
//! Identifiers are resolved once during configuration validation so an
//! unsupported network fails before anything is allocated.

mod discriminators;
mod mossformer2_sr;
pub mod stft;

pub use discriminators::{
    Discriminator, MultiPeriodDiscriminator, MultiResolutionDiscriminator, MultiScaleDiscriminator,
};
pub use mossformer2_sr::{SpectralMapper, WaveGenerator};

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use candle_core::{DType, Module, Tensor, Var, D};
use candle_nn::{VarBuilder, VarMap};
use rand::distr::{Distribution, Uniform};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::info;

use crate::config::TrainConfig;
use crate::error::{Error, Result};
use crate::runtime::RunContext;
use crate::training::optimizers::OptimizerSet;

/// Networks this driver knows how to build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkKind {
    /// 48 kHz speech super-resolution: spectral mapper followed by a
    /// transposed-convolution waveform generator
    MossFormer2Sr48k,
}

impl NetworkKind {
    pub const ALL: [NetworkKind; 1] = [NetworkKind::MossFormer2Sr48k];

    /// Identifier used on the command line and in config files
    pub fn identifier(&self) -> &'static str {
        match self {
            NetworkKind::MossFormer2Sr48k => "MossFormer2_SR_48K",
        }
    }

    /// Build both generator stages and all discriminators on the run's device
    pub fn build(&self, ctx: &RunContext, config: &TrainConfig) -> Result<NetworkBundle> {
        let bundle = match self {
            NetworkKind::MossFormer2Sr48k => mossformer2_sr::build(ctx, config)?,
        };

        if ctx.is_primary() {
            for module in &bundle.models {
                info!("{}: {} trainable parameters", module.name(), module.parameter_count());
            }
            for critic in &bundle.discriminators {
                info!("{}: {} trainable parameters", critic.name(), critic.parameter_count());
            }
        }

        Ok(bundle)
    }

    /// Optimizers paired with this network's module groups
    pub fn optimizers(&self, bundle: &NetworkBundle, config: &TrainConfig) -> Result<OptimizerSet> {
        match self {
            NetworkKind::MossFormer2Sr48k => OptimizerSet::new(bundle, config),
        }
    }
}

impl FromStr for NetworkKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        NetworkKind::ALL
            .into_iter()
            .find(|kind| kind.identifier() == s.trim())
            .ok_or_else(|| Error::UnsupportedNetwork(s.to_string()))
    }
}

impl fmt::Display for NetworkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.identifier())
    }
}

/// A network together with the variables it owns
pub struct Trainable<M: ?Sized> {
    name: String,
    varmap: VarMap,
    net: Box<M>,
}

/// Generator stage
pub type Model = Trainable<dyn Module + Send + Sync>;

/// Adversarial critic
pub type Critic = Trainable<dyn Discriminator>;

impl<M: ?Sized> Trainable<M> {
    /// Build a network with fresh variables, initialised from the run seed
    pub fn new<F>(name: impl Into<String>, ctx: &RunContext, build: F) -> Result<Self>
    where
        F: FnOnce(VarBuilder) -> candle_core::Result<Box<M>>,
    {
        let name = name.into();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &ctx.device);
        let net = build(vb)?;
        seeded_init(&varmap, ctx.seed_for(&name))?;

        Ok(Self { name, varmap, net })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn net(&self) -> &M {
        &self.net
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    /// Trainable variables, sorted by name
    ///
    /// The order is identical on every rank, which collectives that flatten
    /// gradients rely on.
    pub fn vars(&self) -> Vec<Var> {
        let data = self
            .varmap
            .data()
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut named: Vec<(&String, &Var)> = data.iter().collect();
        named.sort_by(|a, b| a.0.cmp(b.0));
        named.into_iter().map(|(_, var)| var.clone()).collect()
    }

    /// Number of scalar trainable parameters
    pub fn parameter_count(&self) -> usize {
        self.vars().iter().map(|var| var.elem_count()).sum()
    }

    /// Write the weights as safetensors
    pub fn save(&self, path: &Path) -> Result<()> {
        self.varmap.save(path)?;
        Ok(())
    }

    /// Overwrite the weights from a safetensors file written by [`Trainable::save`]
    pub fn load(&mut self, path: &Path) -> Result<()> {
        self.varmap
            .load(path)
            .map_err(|e| Error::checkpoint(format!("{} from {}: {}", self.name, path.display(), e)))
    }
}

/// Re-draw every variable from a seeded RNG
///
/// Biases start at zero; weights are uniform in `±1/sqrt(fan_in)`. Variables
/// are visited in name order so the draw sequence is stable.
fn seeded_init(varmap: &VarMap, seed: u64) -> Result<()> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| Error::internal("variable map lock poisoned"))?;
    let mut names: Vec<&String> = data.keys().collect();
    names.sort();

    let mut rng = StdRng::seed_from_u64(seed);
    for name in names {
        let var = &data[name];
        let dims = var.dims();
        let values = if name.ends_with("bias") {
            Tensor::zeros(dims, DType::F32, var.device())?
        } else {
            let fan_in: usize = dims.iter().skip(1).product::<usize>().max(1);
            let bound = 1.0 / (fan_in as f32).sqrt();
            let dist = Uniform::new_inclusive(-bound, bound)
                .map_err(|e| Error::internal(format!("invalid init range for {}: {}", name, e)))?;
            let draws: Vec<f32> = dist.sample_iter(&mut rng).take(var.elem_count()).collect();
            Tensor::from_vec(draws, dims, var.device())?
        };
        var.set(&values.to_dtype(var.dtype())?)?;
    }
    Ok(())
}

/// Modules a run trains
pub struct NetworkBundle {
    /// `models[0]` maps low-resolution audio to latent frames, `models[1]`
    /// synthesises the high-resolution waveform
    pub models: Vec<Model>,
    pub discriminators: Vec<Critic>,
    /// Samples per latent frame
    pub frame_hop: usize,
}

impl NetworkBundle {
    pub fn mapper(&self) -> &Model {
        &self.models[0]
    }

    pub fn generator(&self) -> &Model {
        &self.models[1]
    }

    /// Run both generator stages on a `(batch, samples)` waveform
    pub fn super_resolve(&self, audio: &Tensor) -> Result<Tensor> {
        let samples = audio.dim(D::Minus1)?;
        let remainder = samples % self.frame_hop;
        let padded = if remainder == 0 {
            audio.clone()
        } else {
            audio.pad_with_zeros(D::Minus1, 0, self.frame_hop - remainder)?
        };

        let latent = self.mapper().net().forward(&padded.unsqueeze(1)?)?;
        let output = self.generator().net().forward(&latent)?;
        Ok(output.squeeze(1)?.narrow(D::Minus1, 0, samples)?)
    }

    /// Score `audio` with every discriminator
    pub fn discriminate(&self, audio: &Tensor) -> Result<Vec<Tensor>> {
        let mut scores = Vec::new();
        for critic in &self.discriminators {
            scores.extend(critic.net().forward(audio)?);
        }
        Ok(scores)
    }

    /// Parameter count over every module
    pub fn parameter_count(&self) -> usize {
        self.models.iter().map(Trainable::parameter_count).sum::<usize>()
            + self.discriminators.iter().map(Trainable::parameter_count).sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{init_environment, DistInfo};

    fn small_config(seed: u64) -> TrainConfig {
        TrainConfig {
            seed,
            hidden_channels: 8,
            frame_hop: 40,
            ..TrainConfig::default()
        }
    }

    fn weights(bundle: &NetworkBundle) -> Vec<Vec<f32>> {
        let mut all = Vec::new();
        for module in &bundle.models {
            let data = module.varmap().data().lock().unwrap();
            let mut names: Vec<_> = data.keys().cloned().collect();
            names.sort();
            for name in names {
                all.push(data[&name].flatten_all().unwrap().to_vec1::<f32>().unwrap());
            }
        }
        all
    }

    #[test]
    fn test_identifier_round_trip() {
        let kind: NetworkKind = "MossFormer2_SR_48K".parse().unwrap();
        assert_eq!(kind, NetworkKind::MossFormer2Sr48k);
        assert_eq!(kind.to_string(), "MossFormer2_SR_48K");
    }

    #[test]
    fn test_unknown_identifier_is_rejected() {
        let err = "FRCRN_SE_16K".parse::<NetworkKind>().unwrap_err();
        assert!(matches!(err, Error::UnsupportedNetwork(ref name) if name == "FRCRN_SE_16K"));
    }

    #[test]
    fn test_same_seed_gives_identical_weights() {
        let config = small_config(7);
        let ctx = init_environment(&config, &DistInfo::single()).unwrap();
        let a = NetworkKind::MossFormer2Sr48k.build(&ctx, &config).unwrap();
        let b = NetworkKind::MossFormer2Sr48k.build(&ctx, &config).unwrap();
        assert_eq!(weights(&a), weights(&b));
        assert_eq!(a.parameter_count(), b.parameter_count());
    }

    #[test]
    fn test_different_seed_gives_different_weights() {
        let ctx_a = init_environment(&small_config(1), &DistInfo::single()).unwrap();
        let ctx_b = init_environment(&small_config(2), &DistInfo::single()).unwrap();
        let a = NetworkKind::MossFormer2Sr48k.build(&ctx_a, &small_config(1)).unwrap();
        let b = NetworkKind::MossFormer2Sr48k.build(&ctx_b, &small_config(2)).unwrap();
        assert_ne!(weights(&a), weights(&b));
    }

    #[test]
    fn test_vars_follow_name_order() {
        let config = small_config(5);
        let ctx = init_environment(&config, &DistInfo::single()).unwrap();
        let a = NetworkKind::MossFormer2Sr48k.build(&ctx, &config).unwrap();
        let b = NetworkKind::MossFormer2Sr48k.build(&ctx, &config).unwrap();

        for (module_a, module_b) in a.discriminators.iter().zip(&b.discriminators) {
            let vars_a = module_a.vars();
            let vars_b = module_b.vars();
            assert_eq!(vars_a.len(), vars_b.len());
            for (va, vb) in vars_a.iter().zip(&vars_b) {
                assert_eq!(va.dims(), vb.dims());
                assert_eq!(
                    va.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
                    vb.flatten_all().unwrap().to_vec1::<f32>().unwrap()
                );
            }
        }
    }

    #[test]
    fn test_bundle_shapes() {
        let config = small_config(3);
        let ctx = init_environment(&config, &DistInfo::single()).unwrap();
        let bundle = NetworkKind::MossFormer2Sr48k.build(&ctx, &config).unwrap();
        assert_eq!(bundle.models.len(), 2);
        assert_eq!(bundle.discriminators.len(), 3);

        let audio = Tensor::zeros((2, 410), DType::F32, &ctx.device).unwrap();
        let output = bundle.super_resolve(&audio).unwrap();
        assert_eq!(output.dims(), &[2, 410]);
        assert!(!bundle.discriminate(&output).unwrap().is_empty());
    }
}
