//! speech-sr - training driver for adversarial speech super-resolution
//!
//! This crate trains a two-stage generator (spectral mapper followed by a
//! waveform generator) against multi-period, multi-scale and multi-resolution
//! discriminators to reconstruct 48 kHz speech from band-limited input.

#![warn(rustdoc::broken_intra_doc_links)]

pub mod config;
pub mod error;
pub mod inference;
pub mod logging;
pub mod networks;
pub mod pipeline;
pub mod runtime;
pub mod training;
pub mod utils;

// Re-exports
pub use config::{load_config, CliArgs, RunMode, TrainConfig};
pub use error::{Error, Result};
pub use networks::{NetworkBundle, NetworkKind};
pub use pipeline::{conclude, run, Exit, RunOutcome};
pub use runtime::{CancellationToken, DistInfo, RunContext, Shutdown};
pub use training::{SolveOutcome, Solver};
