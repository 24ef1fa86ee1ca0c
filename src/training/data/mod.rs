//! Data loading for super-resolution training
//!
//! Datasets read WAV clips listed in manifest files and pair each clip with a
//! simulated low-bandwidth version; loaders batch them per epoch behind a
//! rank-aware sampler.

pub mod audio;
pub mod dataset;
pub mod loader;
pub mod sampler;

pub use dataset::{read_manifest, SpeechDataset};
pub use loader::{DataLoader, LoaderOptions};
pub use sampler::DistributedSampler;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use candle_core::Tensor;
use tracing::info;

use crate::config::TrainConfig;
use crate::error::{Error, Result};
use crate::runtime::DistInfo;

/// Dataset partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Split {
    Train,
    Valid,
    Test,
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Split::Train => "train",
            Split::Valid => "valid",
            Split::Test => "test",
        })
    }
}

/// One clip at full rate and its degraded counterpart, equal lengths
#[derive(Debug, Clone)]
pub struct AudioSample {
    pub name: String,
    pub low_res: Vec<f32>,
    pub high_res: Vec<f32>,
}

/// Stacked `(batch, samples)` host tensors
#[derive(Debug, Clone)]
pub struct AudioBatch {
    pub names: Vec<String>,
    pub low_res: Tensor,
    pub high_res: Tensor,
}

impl AudioBatch {
    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Indexed source of samples
///
/// `epoch` lets training items vary their random crop and degradation
/// reproducibly from one epoch to the next.
pub trait Dataset: Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get(&self, index: usize, epoch: usize) -> Result<AudioSample>;
}

/// Train sampler handle (train split only) and the split's loader
pub type SplitLoader = (Option<Arc<DistributedSampler>>, DataLoader);

/// Builds the loader for one split
#[cfg_attr(test, mockall::automock)]
pub trait LoaderFactory: Send + Sync {
    fn build(&self, split: Split) -> Result<SplitLoader>;
}

/// Loaders for every split of a run
pub struct DataGenerators {
    pub train: DataLoader,
    pub train_sampler: Arc<DistributedSampler>,
    pub valid: DataLoader,
    pub test: Option<DataLoader>,
}

/// Build train, validation and (unless disabled) test loaders
///
/// The factory is never asked for the test split when `tt_list` is unset or
/// `none`.
pub fn build_generators(config: &TrainConfig, factory: &dyn LoaderFactory) -> Result<DataGenerators> {
    let (sampler, train) = factory.build(Split::Train)?;
    let train_sampler = sampler.unwrap_or_else(|| train.sampler().clone());
    let (_, valid) = factory.build(Split::Valid)?;

    let test = match config.test_list() {
        Some(_) => Some(factory.build(Split::Test)?.1),
        None => {
            info!("Test list disabled, skipping test loader");
            None
        }
    };

    Ok(DataGenerators {
        train,
        train_sampler,
        valid,
        test,
    })
}

/// [`LoaderFactory`] over the manifests named in the configuration
pub struct ManifestLoaderFactory {
    config: TrainConfig,
    dist: DistInfo,
}

impl ManifestLoaderFactory {
    pub fn new(config: &TrainConfig, dist: &DistInfo) -> Self {
        Self {
            config: config.clone(),
            dist: dist.clone(),
        }
    }

    fn manifest(&self, split: Split) -> Result<PathBuf> {
        let path = match split {
            Split::Train => self.config.tr_list.clone(),
            Split::Valid => self.config.cv_list.clone(),
            Split::Test => self.config.test_list().map(PathBuf::from),
        };
        path.ok_or_else(|| Error::data(format!("no manifest configured for the {} split", split)))
    }
}

impl LoaderFactory for ManifestLoaderFactory {
    fn build(&self, split: Split) -> Result<SplitLoader> {
        let manifest = self.manifest(split)?;
        let dataset = SpeechDataset::from_manifest(&manifest, split, &self.config)?;
        let is_train = split == Split::Train;

        let sampler = Arc::new(DistributedSampler::new(
            dataset.len(),
            self.dist.world_size,
            self.dist.rank,
            is_train,
            self.config.seed,
        ));
        let options = LoaderOptions {
            batch_size: self.config.batch_size,
            num_workers: self.config.num_workers,
            drop_last: is_train,
        };
        let items = dataset.len();
        let loader = DataLoader::new(Arc::new(dataset), sampler.clone(), options);

        if self.dist.rank == 0 {
            info!(
                "{} split: {} clips, {} batches per epoch",
                split,
                items,
                loader.num_batches()
            );
        }

        Ok((is_train.then_some(sampler), loader))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    struct Empty;

    impl Dataset for Empty {
        fn len(&self) -> usize {
            0
        }

        fn get(&self, _index: usize, _epoch: usize) -> Result<AudioSample> {
            Err(Error::data("empty"))
        }
    }

    fn empty_loader(split: Split) -> SplitLoader {
        let sampler = Arc::new(DistributedSampler::new(0, 1, 0, false, 0));
        let options = LoaderOptions {
            batch_size: 1,
            num_workers: 1,
            drop_last: false,
        };
        let loader = DataLoader::new(Arc::new(Empty), sampler.clone(), options);
        ((split == Split::Train).then_some(sampler), loader)
    }

    fn config(tt_list: Option<&str>) -> TrainConfig {
        TrainConfig {
            tt_list: tt_list.map(str::to_string),
            ..TrainConfig::default()
        }
    }

    #[test_case(None, 0; "unset")]
    #[test_case(Some("none"), 0; "lowercase none")]
    #[test_case(Some("NONE"), 0; "uppercase none")]
    #[test_case(Some("lists/test.lst"), 1; "explicit list")]
    fn test_test_loader_construction(tt_list: Option<&str>, test_calls: usize) {
        let mut factory = MockLoaderFactory::new();
        factory
            .expect_build()
            .withf(|split| *split == Split::Train)
            .times(1)
            .returning(|split| Ok(empty_loader(split)));
        factory
            .expect_build()
            .withf(|split| *split == Split::Valid)
            .times(1)
            .returning(|split| Ok(empty_loader(split)));
        factory
            .expect_build()
            .withf(|split| *split == Split::Test)
            .times(test_calls)
            .returning(|split| Ok(empty_loader(split)));

        let generators = build_generators(&config(tt_list), &factory).unwrap();
        assert_eq!(generators.test.is_some(), test_calls == 1);
    }

    #[test]
    fn test_missing_manifest_is_a_data_error() {
        let factory = ManifestLoaderFactory::new(&config(None), &DistInfo::single());
        assert!(matches!(factory.build(Split::Train), Err(Error::Data(_))));
        assert!(matches!(factory.build(Split::Test), Err(Error::Data(_))));
    }
}
