//! Checkpoint management
//!
//! Layout under the checkpoint directory:
//!
//! ```text
//! <checkpoint_dir>/
//!   last_checkpoint          name of the most recent regular tag
//!   <tag>/
//!     model_0.safetensors    spectral mapper
//!     model_1.safetensors    waveform generator
//!     disc_<i>.safetensors   discriminators
//!     state.json             TrainingState
//!   best/                    lowest validation loss so far
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::networks::NetworkBundle;
use crate::training::optimizers::LearningRates;
use crate::utils::io::{ensure_dir_exists, write_file_atomic};

const LAST_CHECKPOINT_FILE: &str = "last_checkpoint";
const STATE_FILE: &str = "state.json";
pub const BEST_TAG: &str = "best";

/// Progress persisted alongside the weights
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingState {
    /// Epochs fully completed; training resumes at this epoch
    pub epoch: usize,
    /// Optimizer steps taken
    pub global_step: usize,
    pub learning_rates: LearningRates,
    pub best_valid_loss: Option<f64>,
    pub epochs_without_improvement: usize,
    pub saved_at: DateTime<Utc>,
}

impl TrainingState {
    pub fn new(learning_rates: LearningRates) -> Self {
        Self {
            epoch: 0,
            global_step: 0,
            learning_rates,
            best_valid_loss: None,
            epochs_without_improvement: 0,
            saved_at: Utc::now(),
        }
    }
}

/// Saves and restores [`NetworkBundle`] weights with their [`TrainingState`]
///
/// Only the primary rank writes; on other ranks saving is a no-op.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    dir: PathBuf,
    writer: bool,
}

impl CheckpointManager {
    pub fn new(dir: impl Into<PathBuf>, writer: bool) -> Self {
        Self { dir: dir.into(), writer }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn tag_dir(&self, tag: &str) -> PathBuf {
        self.dir.join(tag)
    }

    /// Save a regular checkpoint, point `last_checkpoint` at it and remove
    /// the previous regular checkpoint
    pub fn save(&self, tag: &str, bundle: &NetworkBundle, state: &TrainingState) -> Result<Option<PathBuf>> {
        if !self.writer {
            return Ok(None);
        }
        let previous = self.last_tag()?;
        let path = self.write_tag(tag, bundle, state)?;
        write_file_atomic(self.dir.join(LAST_CHECKPOINT_FILE), tag.as_bytes())?;

        if let Some(previous) = previous.filter(|p| p != tag && p != BEST_TAG) {
            let stale = self.tag_dir(&previous);
            if stale.exists() {
                fs::remove_dir_all(&stale)?;
                debug!("Removed superseded checkpoint {}", stale.display());
            }
        }

        info!("Saved checkpoint {}", path.display());
        Ok(Some(path))
    }

    /// Save the best-so-far model without touching `last_checkpoint`
    pub fn save_best(&self, bundle: &NetworkBundle, state: &TrainingState) -> Result<Option<PathBuf>> {
        if !self.writer {
            return Ok(None);
        }
        let path = self.write_tag(BEST_TAG, bundle, state)?;
        info!("Saved best model to {}", path.display());
        Ok(Some(path))
    }

    fn write_tag(&self, tag: &str, bundle: &NetworkBundle, state: &TrainingState) -> Result<PathBuf> {
        ensure_dir_exists(&self.dir)?;
        let partial = self.dir.join(format!("{}.partial", tag));
        if partial.exists() {
            fs::remove_dir_all(&partial)?;
        }
        fs::create_dir_all(&partial)?;

        for (i, model) in bundle.models.iter().enumerate() {
            model.save(&partial.join(format!("model_{}.safetensors", i)))?;
        }
        for (i, critic) in bundle.discriminators.iter().enumerate() {
            critic.save(&partial.join(format!("disc_{}.safetensors", i)))?;
        }
        let state = TrainingState {
            saved_at: Utc::now(),
            ..state.clone()
        };
        fs::write(partial.join(STATE_FILE), serde_json::to_vec_pretty(&state)?)?;

        let target = self.tag_dir(tag);
        if target.exists() {
            fs::remove_dir_all(&target)?;
        }
        fs::rename(&partial, &target)?;
        Ok(target)
    }

    /// Tag named by `last_checkpoint`, if any
    pub fn last_tag(&self) -> Result<Option<String>> {
        let path = self.dir.join(LAST_CHECKPOINT_FILE);
        match fs::read_to_string(&path) {
            Ok(tag) => Ok(Some(tag.trim().to_string()).filter(|t| !t.is_empty())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Load weights and progress from `tag`
    pub fn restore(&self, tag: &str, bundle: &mut NetworkBundle) -> Result<TrainingState> {
        let dir = self.tag_dir(tag);
        if !dir.is_dir() {
            return Err(Error::checkpoint(format!("checkpoint {} not found", dir.display())));
        }
        self.load_weights(&dir, bundle)?;

        let raw = fs::read(dir.join(STATE_FILE))
            .map_err(|e| Error::checkpoint(format!("missing state in {}: {}", dir.display(), e)))?;
        let state: TrainingState = serde_json::from_slice(&raw)?;
        info!(
            "Restored checkpoint {} (epoch {}, step {})",
            tag, state.epoch, state.global_step
        );
        Ok(state)
    }

    /// Resume from `last_checkpoint`; `None` with a warning when there is none
    pub fn restore_last(&self, bundle: &mut NetworkBundle) -> Result<Option<TrainingState>> {
        match self.last_tag()? {
            Some(tag) => Ok(Some(self.restore(&tag, bundle)?)),
            None => {
                warn!("No checkpoint found in {}, training from scratch", self.dir.display());
                Ok(None)
            }
        }
    }

    /// Load the best weights, falling back to the most recent checkpoint
    pub fn restore_for_inference(&self, bundle: &mut NetworkBundle) -> Result<String> {
        let tag = if self.tag_dir(BEST_TAG).is_dir() {
            BEST_TAG.to_string()
        } else {
            self.last_tag()?
                .ok_or_else(|| Error::checkpoint(format!("no trained model in {}", self.dir.display())))?
        };
        self.load_weights(&self.tag_dir(&tag), bundle)?;
        info!("Loaded weights from checkpoint {}", tag);
        Ok(tag)
    }

    fn load_weights(&self, dir: &Path, bundle: &mut NetworkBundle) -> Result<()> {
        for (i, model) in bundle.models.iter_mut().enumerate() {
            model.load(&dir.join(format!("model_{}.safetensors", i)))?;
        }
        for (i, critic) in bundle.discriminators.iter_mut().enumerate() {
            let path = dir.join(format!("disc_{}.safetensors", i));
            if path.exists() {
                critic.load(&path)?;
            } else {
                warn!("{} has no weights for {}", dir.display(), critic.name());
            }
        }
        Ok(())
    }
}
