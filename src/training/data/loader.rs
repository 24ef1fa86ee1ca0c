//! Async batch loading with blocking decode workers

use std::collections::BTreeMap;
use std::sync::Arc;

use candle_core::{Device, Tensor};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use super::sampler::DistributedSampler;
use super::{AudioBatch, AudioSample, Dataset};
use crate::error::{Error, Result};

/// Batching options for a [`DataLoader`]
#[derive(Debug, Clone, Copy)]
pub struct LoaderOptions {
    pub batch_size: usize,
    pub num_workers: usize,
    pub drop_last: bool,
}

/// Restartable per-epoch source of [`AudioBatch`]es
///
/// Each epoch spawns up to `num_workers` workers that decode and collate
/// batches on the blocking pool into a bounded channel. Batches are handed
/// out in sampler order regardless of which worker finished first.
pub struct DataLoader {
    dataset: Arc<dyn Dataset>,
    sampler: Arc<DistributedSampler>,
    options: LoaderOptions,
    epoch: usize,
    stream: Option<BatchStream>,
}

impl DataLoader {
    pub fn new(dataset: Arc<dyn Dataset>, sampler: Arc<DistributedSampler>, options: LoaderOptions) -> Self {
        debug!(
            "Creating DataLoader with batch_size={}, num_workers={}, {} items",
            options.batch_size,
            options.num_workers,
            dataset.len()
        );
        Self {
            dataset,
            sampler,
            options: LoaderOptions {
                batch_size: options.batch_size.max(1),
                num_workers: options.num_workers.max(1),
                ..options
            },
            epoch: 0,
            stream: None,
        }
    }

    /// Items in the underlying dataset
    pub fn dataset_size(&self) -> usize {
        self.dataset.len()
    }

    /// Batches this replica yields per epoch
    pub fn num_batches(&self) -> usize {
        let items = self.sampler.num_samples();
        if self.options.drop_last {
            items / self.options.batch_size
        } else {
            items.div_ceil(self.options.batch_size)
        }
    }

    pub fn sampler(&self) -> &Arc<DistributedSampler> {
        &self.sampler
    }

    /// Restart at `epoch`, discarding any batches still in flight
    pub fn set_epoch(&mut self, epoch: usize) {
        self.epoch = epoch;
        self.sampler.set_epoch(epoch);
        self.stream = None;
    }

    /// Next batch of the current epoch, `None` once it is exhausted
    ///
    /// The call after `None` starts the same epoch again.
    pub async fn next_batch(&mut self) -> Result<Option<AudioBatch>> {
        if self.stream.is_none() {
            self.stream = Some(self.start_epoch());
        }
        let Some(stream) = self.stream.as_mut() else {
            return Ok(None);
        };

        match stream.next().await {
            Some(batch) => batch.map(Some),
            None => {
                self.stream = None;
                Ok(None)
            }
        }
    }

    fn start_epoch(&self) -> BatchStream {
        let mut batches: Vec<Vec<usize>> = self
            .sampler
            .indices()
            .chunks(self.options.batch_size)
            .map(<[usize]>::to_vec)
            .collect();
        if self.options.drop_last && batches.last().is_some_and(|b| b.len() < self.options.batch_size) {
            batches.pop();
        }
        BatchStream::spawn(self.dataset.clone(), batches, self.options.num_workers, self.epoch)
    }
}

type Delivery = (usize, Result<AudioBatch>);

struct BatchStream {
    receiver: mpsc::Receiver<Delivery>,
    reorder: BTreeMap<usize, Result<AudioBatch>>,
    next: usize,
    total: usize,
    workers: Vec<JoinHandle<()>>,
}

impl BatchStream {
    fn spawn(dataset: Arc<dyn Dataset>, batches: Vec<Vec<usize>>, num_workers: usize, epoch: usize) -> Self {
        let total = batches.len();
        let num_workers = num_workers.min(total).max(1);
        let (sender, receiver) = mpsc::channel(num_workers * 2);

        let workers = (0..num_workers)
            .map(|worker_id| {
                let assigned: Vec<(usize, Vec<usize>)> = batches
                    .iter()
                    .cloned()
                    .enumerate()
                    .skip(worker_id)
                    .step_by(num_workers)
                    .collect();
                tokio::spawn(worker(worker_id, dataset.clone(), assigned, epoch, sender.clone()))
            })
            .collect();

        Self {
            receiver,
            reorder: BTreeMap::new(),
            next: 0,
            total,
            workers,
        }
    }

    async fn next(&mut self) -> Option<Result<AudioBatch>> {
        if self.next >= self.total {
            return None;
        }
        loop {
            if let Some(batch) = self.reorder.remove(&self.next) {
                self.next += 1;
                return Some(batch);
            }
            match self.receiver.recv().await {
                Some((position, batch)) => {
                    self.reorder.insert(position, batch);
                }
                None => {
                    self.next = self.total;
                    return Some(Err(Error::data("data workers stopped before the epoch finished")));
                }
            }
        }
    }
}

impl Drop for BatchStream {
    fn drop(&mut self) {
        for handle in &self.workers {
            handle.abort();
        }
    }
}

async fn worker(
    worker_id: usize,
    dataset: Arc<dyn Dataset>,
    batches: Vec<(usize, Vec<usize>)>,
    epoch: usize,
    sender: mpsc::Sender<Delivery>,
) {
    for (position, indices) in batches {
        let dataset = dataset.clone();
        let loaded = tokio::task::spawn_blocking(move || load_batch(dataset.as_ref(), &indices, epoch)).await;
        let batch = match loaded {
            Ok(batch) => batch,
            Err(e) => {
                error!("Worker {} batch {} panicked: {}", worker_id, position, e);
                Err(Error::data(format!("data worker failed: {}", e)))
            }
        };
        if sender.send((position, batch)).await.is_err() {
            debug!("Worker {} channel closed, stopping", worker_id);
            return;
        }
    }
}

/// Load and stack `indices` into one batch on the host
fn load_batch(dataset: &dyn Dataset, indices: &[usize], epoch: usize) -> Result<AudioBatch> {
    let samples = indices
        .iter()
        .map(|&index| dataset.get(index, epoch))
        .collect::<Result<Vec<_>>>()?;
    collate(samples)
}

pub(super) fn collate(samples: Vec<AudioSample>) -> Result<AudioBatch> {
    let batch = samples.len();
    let length = samples.first().map(|s| s.high_res.len()).unwrap_or(0);
    if samples
        .iter()
        .any(|s| s.high_res.len() != length || s.low_res.len() != length)
    {
        return Err(Error::data("samples in a batch must share one length"));
    }

    let mut names = Vec::with_capacity(batch);
    let mut low_res = Vec::with_capacity(batch * length);
    let mut high_res = Vec::with_capacity(batch * length);
    for sample in samples {
        names.push(sample.name);
        low_res.extend(sample.low_res);
        high_res.extend(sample.high_res);
    }

    Ok(AudioBatch {
        names,
        low_res: Tensor::from_vec(low_res, (batch, length), &Device::Cpu)?,
        high_res: Tensor::from_vec(high_res, (batch, length), &Device::Cpu)?,
    })
}
