//! Gradient accumulation, clipping and cross-rank averaging

use candle_core::backprop::GradStore;
use candle_core::{DType, Tensor, Var};

use crate::error::Result;
use crate::runtime::ProcessGroup;

/// Sums gradients for a fixed set of variables across micro-batches
///
/// The [`GradStore`] of the latest backward pass is kept as the carrier
/// handed to the optimizers once the accumulated step is finished.
pub struct GradAccumulator {
    vars: Vec<Var>,
    sums: Vec<Option<Tensor>>,
    micro_batches: usize,
    carrier: Option<GradStore>,
}

/// Outcome of a finished accumulation window
pub struct FinishedStep {
    pub grads: GradStore,
    /// Global gradient norm before clipping
    pub norm: f64,
}

impl GradAccumulator {
    pub fn new(vars: Vec<Var>) -> Self {
        let sums = vars.iter().map(|_| None).collect();
        Self {
            vars,
            sums,
            micro_batches: 0,
            carrier: None,
        }
    }

    /// Micro-batches accumulated since the last finished step
    pub fn pending(&self) -> usize {
        self.micro_batches
    }

    /// Add the gradients of one backward pass
    pub fn accumulate(&mut self, grads: GradStore) -> Result<()> {
        for (var, sum) in self.vars.iter().zip(self.sums.iter_mut()) {
            if let Some(grad) = grads.get(var.as_tensor()) {
                *sum = Some(match sum.take() {
                    Some(acc) => (acc + grad)?,
                    None => grad.clone(),
                });
            }
        }
        self.micro_batches += 1;
        self.carrier = Some(grads);
        Ok(())
    }

    /// Average over micro-batches and ranks, clip, and hand back the store
    ///
    /// Returns `None` when nothing was accumulated. A non-positive
    /// `max_norm` disables clipping.
    pub async fn finish(&mut self, group: Option<&mut ProcessGroup>, max_norm: f64) -> Result<Option<FinishedStep>> {
        let Some(mut store) = self.carrier.take() else {
            return Ok(None);
        };

        let scale = 1.0 / self.micro_batches.max(1) as f64;
        let mut grads = Vec::with_capacity(self.vars.len());
        for (var, sum) in self.vars.iter().zip(self.sums.iter_mut()) {
            grads.push(match sum.take() {
                Some(grad) => (grad * scale)?,
                None => var.zeros_like()?,
            });
        }
        self.micro_batches = 0;

        if let Some(group) = group {
            grads = all_reduce_mean(group, grads).await?;
        }

        let norm = global_norm(&grads)?;
        if max_norm > 0.0 && norm > max_norm {
            let factor = max_norm / (norm + 1e-6);
            grads = grads
                .into_iter()
                .map(|grad| grad * factor)
                .collect::<candle_core::Result<Vec<_>>>()?;
        }

        for (var, grad) in self.vars.iter().zip(grads) {
            store.insert(var.as_tensor(), grad);
        }
        Ok(Some(FinishedStep { grads: store, norm }))
    }
}

/// L2 norm over every tensor in `grads`
pub fn global_norm(grads: &[Tensor]) -> Result<f64> {
    let mut total = 0.0f64;
    for grad in grads {
        total += grad.to_dtype(DType::F32)?.sqr()?.sum_all()?.to_scalar::<f32>()? as f64;
    }
    Ok(total.sqrt())
}

/// Average `tensors` element-wise across the process group
pub async fn all_reduce_mean(group: &mut ProcessGroup, tensors: Vec<Tensor>) -> Result<Vec<Tensor>> {
    let mut flat = Vec::new();
    for tensor in &tensors {
        flat.extend(tensor.flatten_all()?.to_dtype(DType::F32)?.to_vec1::<f32>()?);
    }

    group.all_reduce_mean(&mut flat).await?;

    let mut offset = 0;
    let mut reduced = Vec::with_capacity(tensors.len());
    for tensor in &tensors {
        let len = tensor.elem_count();
        let values = Tensor::from_slice(&flat[offset..offset + len], tensor.shape(), tensor.device())?;
        reduced.push(values.to_dtype(tensor.dtype())?);
        offset += len;
    }
    Ok(reduced)
}
