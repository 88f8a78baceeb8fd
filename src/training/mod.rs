//! Everything needed to take an optimiser step on a batch: the losses, learning rate schedule,
//! gradient clipping and the [`Trainer`] tying them together. Loading datasets and scheduling
//! epochs is left to the caller, see the `trainer` binary for the simplest possible loop.
use crate::error::Result;
use crate::tacotron2::layers::NON_TRAINABLE_SUFFIXES;
use crate::tacotron2::{Tacotron2, UpdateOps};
use candle_core::backprop::GradStore;
use candle_core::{DType, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarMap};
use serde::Serialize;
use std::sync::PoisonError;
use tracing::debug;

pub mod loss;

pub use loss::{LossModule, LossScalars, Losses};

/// `initial * 0.5^(step / halflife)`, the rate halves every `halflife` steps.
pub fn exponential_decay(initial: f64, global_step: usize, halflife: usize) -> f64 {
    initial * 0.5f64.powf(global_step as f64 / halflife as f64)
}

/// Rescales the gradients of `vars` so their combined L2 norm is at most `max_norm`. Returns the
/// norm from before clipping.
pub fn clip_by_global_norm(grads: &mut GradStore, vars: &[Var], max_norm: f64) -> Result<f64> {
    let mut sum_sq = 0.0f64;
    for var in vars {
        if let Some(grad) = grads.get(var.as_tensor()) {
            sum_sq += grad
                .sqr()?
                .sum_all()?
                .to_dtype(DType::F64)?
                .to_scalar::<f64>()?;
        }
    }
    let norm = sum_sq.sqrt();
    if norm > max_norm {
        let scale = max_norm / norm;
        for var in vars {
            if let Some(grad) = grads.remove(var.as_tensor()) {
                grads.insert(var.as_tensor(), grad.affine(scale, 0.0)?);
            }
        }
    }
    Ok(norm)
}

/// What happened during one optimiser step.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct StepReport {
    /// Step counter after this step
    pub global_step: usize,
    pub learning_rate: f64,
    /// Global gradient norm before clipping
    pub grad_norm: f64,
    pub losses: LossScalars,
}

/// Adam over every trainable parameter of a model.
pub struct Trainer {
    optimizer: AdamW,
    vars: Vec<Var>,
    updates: UpdateOps,
    initial_learning_rate: f64,
    halflife: usize,
    grad_clip_norm: f64,
}

impl Trainer {
    /// `varmap` must be the map `model` was built from. Batch norm running statistics live in
    /// the same map but are skipped, they only change through the model's update ops.
    pub fn new(varmap: &VarMap, model: &Tacotron2) -> Result<Self> {
        let hp = model.hparams();
        let vars = {
            let data = varmap.data().lock().unwrap_or_else(PoisonError::into_inner);
            let mut named = data
                .iter()
                .filter(|(name, _)| {
                    !NON_TRAINABLE_SUFFIXES
                        .iter()
                        .any(|suffix| name.ends_with(suffix))
                })
                .map(|(name, var)| (name.clone(), var.clone()))
                .collect::<Vec<_>>();
            // Sorted so the optimiser state lines up between runs
            named.sort_by(|a, b| a.0.cmp(&b.0));
            named.into_iter().map(|(_, var)| var).collect::<Vec<_>>()
        };
        debug!("Training {} parameter tensors", vars.len());

        let params = ParamsAdamW {
            lr: hp.initial_learning_rate,
            beta1: hp.adam_beta1,
            beta2: hp.adam_beta2,
            eps: hp.adam_epsilon,
            weight_decay: 0.0,
        };
        let optimizer = AdamW::new(vars.clone(), params)?;
        Ok(Self {
            optimizer,
            vars,
            updates: model.update_ops().clone(),
            initial_learning_rate: hp.initial_learning_rate,
            halflife: hp.learning_rate_decay_halflife,
            grad_clip_norm: hp.grad_clip_norm,
        })
    }

    pub fn learning_rate(&self, global_step: usize) -> f64 {
        exponential_decay(self.initial_learning_rate, global_step, self.halflife)
    }

    /// Backpropagates `losses.total`, clips the gradients, applies the pending batch norm
    /// updates and then the optimiser update.
    pub fn step(&mut self, losses: &Losses, global_step: usize) -> Result<StepReport> {
        let learning_rate = self.learning_rate(global_step);
        self.optimizer.set_learning_rate(learning_rate);

        let mut grads = losses.total.backward()?;
        let grad_norm = clip_by_global_norm(&mut grads, &self.vars, self.grad_clip_norm)?;
        let applied = self.updates.run()?;
        self.optimizer.step(&grads)?;

        let report = StepReport {
            global_step: global_step + 1,
            learning_rate,
            grad_norm,
            losses: losses.scalars()?,
        };
        debug!(
            "Step {}: lr {:.6}, grad norm {:.4}, {} statistic updates, loss {:.5}",
            report.global_step, learning_rate, grad_norm, applied, report.losses.total
        );
        Ok(report)
    }
}
