//! Run orchestration
//!
//! Validate configuration, initialise the environment, join the worker
//! group, then build networks, optimizers and loaders and hand them to the
//! solver (or to inference). Collaborators with side effects outside the
//! process are passed in so runs can be driven with substitutes.

use std::path::PathBuf;
use std::time::Duration;

use candle_core::Device;
use tracing::{debug, info, warn};

use crate::config::{RunMode, TrainConfig};
use crate::error::{Error, Result};
use crate::inference;
use crate::runtime::{bootstrap, init_environment, CancellationToken, DistInfo, Rendezvous, Shutdown};
use crate::training::data::{build_generators, LoaderFactory};
use crate::training::solver::{SolveOutcome, Solver};

/// What a completed run produced
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Trained(SolveOutcome),
    Inferred(Vec<PathBuf>),
    /// Cancelled before training or inference started
    Interrupted,
}

impl RunOutcome {
    pub fn was_cancelled(&self) -> bool {
        matches!(
            self,
            RunOutcome::Trained(SolveOutcome::Cancelled { .. }) | RunOutcome::Interrupted
        )
    }
}

/// How the process should end
#[derive(Debug)]
pub enum Exit {
    Success,
    /// Stopped by an interrupt; exit status 0
    Interrupted,
    Failed(Error),
}

/// Run the cleanup hooks and decide how the process ends
///
/// An error raised while an interrupt was pending counts as an interrupt.
pub fn conclude(result: Result<RunOutcome>, cancel: &CancellationToken, shutdown: &Shutdown) -> Exit {
    shutdown.cleanup();
    match result {
        Ok(outcome) if outcome.was_cancelled() || cancel.is_cancelled() => Exit::Interrupted,
        Ok(_) => Exit::Success,
        Err(e) if cancel.is_cancelled() => {
            info!("Run stopped after interrupt: {}", e);
            Exit::Interrupted
        }
        Err(e) => Exit::Failed(e),
    }
}

/// Whether `cancel` was set before `stage` could start
fn interrupted_before(cancel: &CancellationToken, stage: &str) -> bool {
    if cancel.is_cancelled() {
        info!("Interrupted before {}", stage);
        return true;
    }
    false
}

/// Execute one run
///
/// An unsupported network or invalid configuration fails before any device,
/// process group, module or loader is created. A device release hook is
/// registered with `shutdown` as soon as the device is chosen. `cancel` is
/// checked between setup stages and interrupts the rendezvous.
pub async fn run(
    config: &TrainConfig,
    dist: &DistInfo,
    rendezvous: &dyn Rendezvous,
    loaders: &dyn LoaderFactory,
    cancel: CancellationToken,
    shutdown: &Shutdown,
) -> Result<RunOutcome> {
    config.validate()?;
    let kind = config.network_kind()?;

    let ctx = init_environment(config, dist)?;
    if ctx.is_primary() {
        info!(
            "Started {:?} run of {} on {}",
            config.mode,
            kind,
            config.checkpoint_dir.display()
        );
        if config.load_fbank {
            warn!("load_fbank is set, but the networks consume raw waveforms; ignoring it");
        }
        if dist.is_distributed() && config.num_gpu != dist.world_size {
            warn!(
                "num_gpu is {} but WORLD_SIZE is {}; using WORLD_SIZE",
                config.num_gpu, dist.world_size
            );
        }
    }
    let device = ctx.device.clone();
    shutdown.register(move || release_device(&device));

    if interrupted_before(&cancel, "joining the process group") {
        return Ok(RunOutcome::Interrupted);
    }
    let group = tokio::select! {
        group = bootstrap(dist, rendezvous, Duration::from_secs(config.dist_timeout_secs)) => group?,
        _ = cancel.cancelled() => {
            info!("Interrupted while joining the process group");
            return Ok(RunOutcome::Interrupted);
        }
    };

    match config.mode {
        RunMode::Train => {
            if interrupted_before(&cancel, "building networks") {
                return Ok(RunOutcome::Interrupted);
            }
            let networks = kind.build(&ctx, config)?;
            let optimizers = kind.optimizers(&networks, config)?;
            if interrupted_before(&cancel, "building data loaders") {
                return Ok(RunOutcome::Interrupted);
            }
            let data = build_generators(config, loaders)?;
            if interrupted_before(&cancel, "training") {
                return Ok(RunOutcome::Interrupted);
            }

            let mut solver = Solver::new(config.clone(), ctx, networks, optimizers, data, group, cancel)?;
            let outcome = solver.train().await?;
            info!("Training finished: {:?}", outcome);
            Ok(RunOutcome::Trained(outcome))
        }
        RunMode::Inference => {
            if interrupted_before(&cancel, "building networks") {
                return Ok(RunOutcome::Interrupted);
            }
            let mut networks = kind.build(&ctx, config)?;
            let written = inference::run(&ctx, config, &mut networks, &cancel)?;
            info!("Wrote {} enhanced file(s)", written.len());
            Ok(RunOutcome::Inferred(written))
        }
    }
}

/// Wait for queued device work so its memory can be reclaimed
fn release_device(device: &Device) {
    if device.is_cpu() {
        debug!("Host device, nothing to release");
        return;
    }
    match device.synchronize() {
        Ok(()) => info!("Released device memory"),
        Err(e) => warn!("Device synchronisation failed during cleanup: {}", e),
    }
}
