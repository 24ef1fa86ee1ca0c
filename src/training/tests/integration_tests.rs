//! Full runs through the pipeline entry point

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;

use crate::config::{RunMode, TrainConfig};
use crate::error::Error;
use crate::inference::OUTPUT_DIR;
use crate::pipeline::{conclude, run, Exit, RunOutcome};
use crate::runtime::distributed::MockRendezvous;
use crate::runtime::{CancellationToken, DistInfo, ProcessGroup, Rendezvous, Shutdown};
use crate::training::checkpoints::CheckpointManager;
use crate::training::data::audio::read_wav;
use crate::training::data::{
    AudioSample, DataLoader, Dataset, DistributedSampler, LoaderFactory, LoaderOptions, ManifestLoaderFactory,
    MockLoaderFactory, SpeechDataset, Split, SplitLoader,
};
use crate::training::solver::SolveOutcome;

use super::fixtures::{TrainingTestFixture, RATE};

fn solo_rendezvous() -> MockRendezvous {
    let mut rendezvous = MockRendezvous::new();
    rendezvous.expect_join().times(0);
    rendezvous
}

#[tokio::test]
async fn test_unsupported_network_fails_before_setup() {
    let mut fixture = TrainingTestFixture::new();
    fixture.config.network = "WaveUNet_16K".to_string();

    let mut loaders = MockLoaderFactory::new();
    loaders.expect_build().times(0);
    let shutdown = Shutdown::new();

    let result = run(
        &fixture.config,
        &DistInfo::single(),
        &solo_rendezvous(),
        &loaders,
        CancellationToken::new(),
        &shutdown,
    )
    .await;

    assert!(matches!(result, Err(Error::UnsupportedNetwork(name)) if name == "WaveUNet_16K"));
    assert!(!fixture.config.checkpoint_dir.exists());
}

#[tokio::test]
async fn test_loader_failure_aborts_training() {
    let fixture = TrainingTestFixture::new();
    let mut loaders = MockLoaderFactory::new();
    loaders
        .expect_build()
        .times(1)
        .returning(|split| Err(Error::data(format!("cannot open {} manifest", split))));
    let shutdown = Shutdown::new();

    let result = run(
        &fixture.config,
        &DistInfo::single(),
        &solo_rendezvous(),
        &loaders,
        CancellationToken::new(),
        &shutdown,
    )
    .await;

    assert!(matches!(result, Err(Error::Data(_))));
    assert!(shutdown.cleanup());
}

#[tokio::test]
async fn test_train_then_infer() -> Result<()> {
    let mut fixture = TrainingTestFixture::new();
    fixture.config.max_epoch = 1;
    let dist = DistInfo::single();
    let shutdown = Shutdown::new();

    let loaders = ManifestLoaderFactory::new(&fixture.config, &dist);
    let outcome = run(
        &fixture.config,
        &dist,
        &solo_rendezvous(),
        &loaders,
        CancellationToken::new(),
        &shutdown,
    )
    .await?;
    assert!(matches!(
        outcome,
        RunOutcome::Trained(SolveOutcome::Completed { epochs: 1, .. })
    ));
    assert!(!outcome.was_cancelled());

    let input = fixture.dir.path().join("clips").join("clip_0.wav");
    let mut config = fixture.config.clone();
    config.mode = RunMode::Inference;
    config.input_path = Some(input.clone());

    let mut loaders = MockLoaderFactory::new();
    loaders.expect_build().times(0);
    let outcome = run(
        &config,
        &dist,
        &solo_rendezvous(),
        &loaders,
        CancellationToken::new(),
        &shutdown,
    )
    .await?;

    let expected = config.checkpoint_dir.join(OUTPUT_DIR).join("clip_0_sr.wav");
    assert_eq!(outcome, RunOutcome::Inferred(vec![expected.clone()]));
    assert_eq!(read_wav(&expected, RATE)?.len(), read_wav(&input, RATE)?.len());

    assert!(shutdown.cleanup());
    assert!(!shutdown.cleanup());
    Ok(())
}

/// Rendezvous whose peers never show up
struct StalledRendezvous;

#[async_trait]
impl Rendezvous for StalledRendezvous {
    async fn join(&self, _info: &DistInfo, _deadline: Duration) -> crate::Result<ProcessGroup> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Err(Error::distributed("peers never arrived"))
    }
}

#[tokio::test]
async fn test_interrupt_during_rendezvous() -> Result<()> {
    let fixture = TrainingTestFixture::new();
    let dist = DistInfo {
        world_size: 2,
        rank: 1,
        local_rank: 0,
        master_addr: "127.0.0.1".to_string(),
        master_port: 29500,
    };
    let mut loaders = MockLoaderFactory::new();
    loaders.expect_build().times(0);
    let cancel = CancellationToken::new();
    let shutdown = Shutdown::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let result = tokio::time::timeout(
        Duration::from_secs(10),
        run(&fixture.config, &dist, &StalledRendezvous, &loaders, cancel.clone(), &shutdown),
    )
    .await?;
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(result?, RunOutcome::Interrupted);
    Ok(())
}

#[tokio::test]
async fn test_cancelled_token_stops_before_setup() -> Result<()> {
    let fixture = TrainingTestFixture::new();
    let mut loaders = MockLoaderFactory::new();
    loaders.expect_build().times(0);
    let cancel = CancellationToken::new();
    cancel.cancel();
    let shutdown = Shutdown::new();

    let outcome = run(
        &fixture.config,
        &DistInfo::single(),
        &solo_rendezvous(),
        &loaders,
        cancel.clone(),
        &shutdown,
    )
    .await?;
    assert_eq!(outcome, RunOutcome::Interrupted);
    assert!(matches!(conclude(Ok(outcome), &cancel, &shutdown), Exit::Interrupted));
    Ok(())
}

/// Training items that trip the token once `epoch` is reached
struct CancellingDataset {
    inner: SpeechDataset,
    cancel: CancellationToken,
    epoch: usize,
}

impl Dataset for CancellingDataset {
    fn len(&self) -> usize {
        self.inner.len()
    }

    fn get(&self, index: usize, epoch: usize) -> crate::Result<AudioSample> {
        if epoch >= self.epoch {
            self.cancel.cancel();
        }
        self.inner.get(index, epoch)
    }
}

/// Manifest loaders whose training split cancels the run at `epoch`
struct CancelAtEpoch {
    manifests: ManifestLoaderFactory,
    config: TrainConfig,
    cancel: CancellationToken,
    epoch: usize,
}

impl LoaderFactory for CancelAtEpoch {
    fn build(&self, split: Split) -> crate::Result<SplitLoader> {
        if split != Split::Train {
            return self.manifests.build(split);
        }
        let manifest = self.config.tr_list.clone().unwrap();
        let dataset = CancellingDataset {
            inner: SpeechDataset::from_manifest(&manifest, split, &self.config)?,
            cancel: self.cancel.clone(),
            epoch: self.epoch,
        };
        let sampler = Arc::new(DistributedSampler::new(dataset.len(), 1, 0, true, self.config.seed));
        let options = LoaderOptions {
            batch_size: self.config.batch_size,
            num_workers: 1,
            drop_last: true,
        };
        let loader = DataLoader::new(Arc::new(dataset), sampler.clone(), options);
        Ok((Some(sampler), loader))
    }
}

#[tokio::test]
async fn test_interrupt_mid_epoch_cleans_up_once() -> Result<()> {
    let mut fixture = TrainingTestFixture::new();
    fixture.config.max_epoch = 3;
    let dist = DistInfo::single();
    let cancel = CancellationToken::new();
    let shutdown = Shutdown::new();

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    shutdown.register(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let loaders = CancelAtEpoch {
        manifests: ManifestLoaderFactory::new(&fixture.config, &dist),
        config: fixture.config.clone(),
        cancel: cancel.clone(),
        epoch: 1,
    };
    let result = run(
        &fixture.config,
        &dist,
        &solo_rendezvous(),
        &loaders,
        cancel.clone(),
        &shutdown,
    )
    .await;

    assert!(matches!(
        result,
        Ok(RunOutcome::Trained(SolveOutcome::Cancelled { epoch: 1, .. }))
    ));
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    assert!(matches!(conclude(result, &cancel, &shutdown), Exit::Interrupted));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(!shutdown.cleanup());
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Only the epoch that finished before the interrupt was saved
    let manager = CheckpointManager::new(&fixture.config.checkpoint_dir, true);
    assert_eq!(manager.last_tag()?.as_deref(), Some("epoch_0001"));
    Ok(())
}
