//! Training infrastructure for speech super-resolution
//!
//! # Main Components
//!
//! - **Data**: manifest datasets, rank-aware sampling and async batch loading
//! - **Optimizers**: per-group AdamW with decay, accumulation and clipping
//! - **Loss**: least-squares adversarial and reconstruction objectives
//! - **Checkpoints**: tagged weight snapshots with resumable progress
//! - **Solver**: the adversarial epoch loop
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use speech_sr::training::{build_generators, ManifestLoaderFactory, Solver};
//!
//! let data = build_generators(&config, &ManifestLoaderFactory::new(&config, &ctx.dist))?;
//! let mut solver = Solver::new(config, ctx, networks, optimizers, data, group, cancel)?;
//! let outcome = solver.train().await?;
//! ```

pub mod checkpoints;
pub mod data;
pub mod loss;
pub mod optimizers;
pub mod solver;

#[cfg(test)]
mod tests;

pub use checkpoints::{CheckpointManager, TrainingState, BEST_TAG};
pub use data::{
    build_generators, AudioBatch, DataGenerators, DataLoader, Dataset, DistributedSampler, LoaderFactory,
    ManifestLoaderFactory, Split,
};
pub use optimizers::{LearningRates, OptimizerSet};
pub use solver::{SolveOutcome, Solver};
