//! Process-level runtime state: seeding, device selection, distributed
//! bootstrap and shutdown coordination
//!
//! Everything a run would otherwise keep as ambient global state is captured
//! once in an immutable [`RunContext`] that is passed down explicitly.

pub mod distributed;
pub mod shutdown;

pub use distributed::{bootstrap, DistInfo, ProcessGroup, Rendezvous, TcpRendezvous};
pub use shutdown::{install_interrupt_handler, on_interrupt, CancellationToken, InterruptAction, Shutdown};

use candle_core::Device;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info, warn};

use crate::config::TrainConfig;
use crate::error::Result;
use crate::utils::seed;

/// Environment variable mirroring the run seed for child processes
pub const SEED_ENV: &str = "SPEECH_SR_SEED";

/// cuBLAS workspace setting required for deterministic GEMM kernels
const CUBLAS_WORKSPACE_ENV: &str = "CUBLAS_WORKSPACE_CONFIG";

/// Immutable per-run context
#[derive(Debug, Clone)]
pub struct RunContext {
    /// Base seed every random stream of the run derives from
    pub seed: u64,
    /// Compute device all modules and batches live on
    pub device: Device,
    /// Deterministic kernel selection was requested
    pub deterministic: bool,
    /// Position of this process in the worker group
    pub dist: DistInfo,
}

impl RunContext {
    /// Whether this process owns operator-facing output
    pub fn is_primary(&self) -> bool {
        self.dist.rank == 0
    }

    pub fn rank(&self) -> usize {
        self.dist.rank
    }

    pub fn world_size(&self) -> usize {
        self.dist.world_size
    }

    /// Seed for a named random stream
    pub fn seed_for(&self, label: &str) -> u64 {
        seed::derive(self.seed, label)
    }

    /// Independent RNG for a named random stream
    pub fn rng_for(&self, label: &str) -> StdRng {
        StdRng::seed_from_u64(self.seed_for(label))
    }
}

/// Seed random sources, force deterministic kernels and pick the device
pub fn init_environment(config: &TrainConfig, dist: &DistInfo) -> Result<RunContext> {
    std::env::set_var(SEED_ENV, config.seed.to_string());
    if std::env::var_os(CUBLAS_WORKSPACE_ENV).is_none() {
        std::env::set_var(CUBLAS_WORKSPACE_ENV, ":4096:8");
    }

    let ordinal = if dist.is_distributed() { dist.local_rank } else { 0 };
    let device = select_device(config.use_cuda, ordinal)?;

    if !device.is_cpu() {
        device.set_seed(config.seed)?;
    }

    info!(
        seed = config.seed,
        device = ?device,
        rank = dist.rank,
        world_size = dist.world_size,
        "Environment initialized"
    );

    Ok(RunContext {
        seed: config.seed,
        device,
        deterministic: true,
        dist: dist.clone(),
    })
}

/// Accelerator if requested and available, host CPU otherwise
pub fn select_device(requested: bool, ordinal: usize) -> Result<Device> {
    if !requested {
        debug!("Accelerator not requested, using CPU");
        return Ok(Device::Cpu);
    }
    if candle_core::utils::cuda_is_available() {
        return Ok(Device::new_cuda(ordinal)?);
    }
    if candle_core::utils::metal_is_available() {
        return Ok(Device::new_metal(ordinal)?);
    }
    warn!("Accelerator requested but none is available; falling back to CPU");
    Ok(Device::Cpu)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(seed: u64) -> TrainConfig {
        TrainConfig {
            seed,
            use_cuda: false,
            ..TrainConfig::default()
        }
    }

    #[test]
    fn test_cpu_when_not_requested() {
        let device = select_device(false, 0).unwrap();
        assert!(device.is_cpu());
    }

    #[test]
    fn test_same_seed_same_context() {
        let a = init_environment(&config(11), &DistInfo::single()).unwrap();
        let b = init_environment(&config(11), &DistInfo::single()).unwrap();
        assert!(a.device.same_device(&b.device));
        assert_eq!(a.seed_for("generator"), b.seed_for("generator"));
        assert!(std::env::var(SEED_ENV).is_ok());
        assert!(a.is_primary());
    }

    #[test]
    fn test_named_streams_are_independent() {
        use rand::Rng;
        let ctx = init_environment(&config(3), &DistInfo::single()).unwrap();
        let x: u64 = ctx.rng_for("a").random();
        let y: u64 = ctx.rng_for("b").random();
        let z: u64 = ctx.rng_for("a").random();
        assert_ne!(x, y);
        assert_eq!(x, z);
    }
}
