//! Manifest-backed speech dataset

use std::fs;
use std::path::{Path, PathBuf};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use super::audio::{degrade, read_wav};
use super::{AudioSample, Dataset, Split};
use crate::config::TrainConfig;
use crate::error::{Error, Result};
use crate::utils::seed;

/// Read a manifest: one WAV path per line, `#` comments and blank lines
/// ignored, relative paths resolved against the manifest's directory
pub fn read_manifest(path: &Path) -> Result<Vec<PathBuf>> {
    let content = fs::read_to_string(path)
        .map_err(|e| Error::data(format!("cannot read manifest {}: {}", path.display(), e)))?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));

    let entries: Vec<PathBuf> = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| {
            let entry = PathBuf::from(line);
            if entry.is_absolute() {
                entry
            } else {
                base.join(entry)
            }
        })
        .collect();

    debug!("Manifest {}: {} entries", path.display(), entries.len());
    Ok(entries)
}

/// Speech clips paired with simulated low-bandwidth versions
pub struct SpeechDataset {
    files: Vec<PathBuf>,
    split: Split,
    segment: usize,
    sampling_rate: u32,
    lr_rates: Vec<u32>,
    seed: u64,
}

impl SpeechDataset {
    pub fn new(files: Vec<PathBuf>, split: Split, config: &TrainConfig) -> Self {
        let mut lr_rates = config.lr_sampling_rates.clone();
        lr_rates.sort_unstable();
        Self {
            files,
            split,
            segment: config.segment_samples(),
            sampling_rate: config.sampling_rate,
            lr_rates,
            seed: config.seed,
        }
    }

    pub fn from_manifest(manifest: &Path, split: Split, config: &TrainConfig) -> Result<Self> {
        let files = read_manifest(manifest)?;
        if files.is_empty() {
            return Err(Error::data(format!("manifest {} lists no audio files", manifest.display())));
        }
        Ok(Self::new(files, split, config))
    }

    /// Samples per item
    pub fn segment(&self) -> usize {
        self.segment
    }

    fn crop(&self, mut audio: Vec<f32>, rng: Option<&mut StdRng>) -> Vec<f32> {
        let start = match rng {
            Some(rng) if audio.len() > self.segment => rng.random_range(0..=audio.len() - self.segment),
            _ => 0,
        };
        audio.drain(..start);
        audio.resize(self.segment, 0.0);
        audio
    }
}

impl Dataset for SpeechDataset {
    fn len(&self) -> usize {
        self.files.len()
    }

    fn get(&self, index: usize, epoch: usize) -> Result<AudioSample> {
        let path = self
            .files
            .get(index)
            .ok_or_else(|| Error::data(format!("index {} out of range ({} items)", index, self.files.len())))?;
        let audio = read_wav(path, self.sampling_rate)?;

        let (high_res, low_rate) = if self.split == Split::Train {
            let mut rng = StdRng::seed_from_u64(seed::derive_indexed(self.seed, &[epoch as u64, index as u64]));
            let high_res = self.crop(audio, Some(&mut rng));
            let low_rate = match self.lr_rates.len() {
                0 => self.sampling_rate,
                n => self.lr_rates[rng.random_range(0..n)],
            };
            (high_res, low_rate)
        } else {
            let low_rate = self.lr_rates.first().copied().unwrap_or(self.sampling_rate);
            (self.crop(audio, None), low_rate)
        };

        Ok(AudioSample {
            name: path
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_else(|| index.to_string()),
            low_res: degrade(&high_res, self.sampling_rate, low_rate),
            high_res,
        })
    }
}
