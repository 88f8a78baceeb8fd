//! Building blocks shared by the encoder, postnet and expander: length masks, batch
//! normalisation with deferred running statistics, and the conv + norm + activation block.
use candle_core::{DType, Device, Module, Result, Tensor, Var};
use candle_nn::{conv1d, Conv1d, Conv1dConfig, Init, VarBuilder};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Parameter names that hold running statistics rather than trainable weights.
pub const NON_TRAINABLE_SUFFIXES: [&str; 2] = ["running_mean", "running_var"];

/// Builds a `[N, max_len]` float mask which is 1.0 for valid steps and 0.0 for padding.
pub fn sequence_mask(lengths: &[usize], max_len: usize, device: &Device) -> Result<Tensor> {
    let mask = lengths
        .iter()
        .flat_map(|&len| (0..max_len).map(move |t| if t < len { 1.0f32 } else { 0.0 }))
        .collect::<Vec<_>>();
    Tensor::from_vec(mask, (lengths.len(), max_len), device)
}

#[derive(Debug)]
struct PendingUpdate {
    target: Var,
    value: Tensor,
}

/// Updates that have to land before the optimiser applies gradients.
///
/// Batch norm layers compute their new moving averages during the training forward pass but
/// don't write them straight away, instead they push them here. Every normalisation layer in a
/// model shares one collection (it's cheap to clone) and the trainer runs it right before the
/// parameter update so the statistics reflect the batch the step was computed on.
#[derive(Debug, Clone, Default)]
pub struct UpdateOps {
    pending: Arc<Mutex<Vec<PendingUpdate>>>,
}

impl UpdateOps {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<PendingUpdate>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Schedules `value` to be written to `target`. Each variable has at most one pending
    /// update, a newer forward pass replaces whatever an older one scheduled.
    pub(crate) fn push(&self, target: Var, value: Tensor) {
        let mut pending = self.lock();
        let id = target.as_tensor().id();
        match pending.iter_mut().find(|p| p.target.as_tensor().id() == id) {
            Some(existing) => existing.value = value,
            None => pending.push(PendingUpdate { target, value }),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Applies and clears every pending update, returning how many were applied.
    pub fn run(&self) -> Result<usize> {
        let updates = std::mem::take(&mut *self.lock());
        for update in &updates {
            update.target.set(&update.value)?;
        }
        Ok(updates.len())
    }
}

#[derive(Clone, Copy, Debug)]
pub struct NormConfig {
    pub momentum: f64,
    pub epsilon: f64,
}

/// Batch normalisation over the channel axis of a `[N, C, T]` tensor.
///
/// In training the batch statistics only count valid timesteps when a mask is given, so the
/// amount of padding in a batch doesn't shift the normalisation.
#[derive(Debug)]
pub struct BatchNorm1d {
    weight: Tensor,
    bias: Tensor,
    running_mean: Var,
    running_var: Var,
    config: NormConfig,
    updates: UpdateOps,
}

impl BatchNorm1d {
    pub fn new(
        channels: usize,
        config: NormConfig,
        updates: &UpdateOps,
        vb: VarBuilder,
    ) -> Result<Self> {
        let weight = vb.get_with_hints(channels, "weight", Init::Const(1.0))?;
        let bias = vb.get_with_hints(channels, "bias", Init::Const(0.0))?;
        let running_mean = Var::from_tensor(&vb.get_with_hints(
            channels,
            NON_TRAINABLE_SUFFIXES[0],
            Init::Const(0.0),
        )?)?;
        let running_var = Var::from_tensor(&vb.get_with_hints(
            channels,
            NON_TRAINABLE_SUFFIXES[1],
            Init::Const(1.0),
        )?)?;
        Ok(Self {
            weight,
            bias,
            running_mean,
            running_var,
            config,
            updates: updates.clone(),
        })
    }

    /// Mean and (biased) variance per channel, each `[C]`.
    fn batch_statistics(&self, xs: &Tensor, mask: Option<&Tensor>) -> Result<(Tensor, Tensor)> {
        let (batch, channels, time) = xs.dims3()?;
        let (masked, count) = match mask {
            Some(mask) => {
                let count = mask.sum_all()?.to_scalar::<f32>()? as f64;
                (xs.broadcast_mul(mask)?, count.max(1.0))
            }
            None => (xs.clone(), (batch * time) as f64),
        };
        let mean = (masked.sum(2)?.sum(0)? / count)?;
        let centered = xs.broadcast_sub(&mean.reshape((1, channels, 1))?)?;
        let centered = match mask {
            Some(mask) => centered.broadcast_mul(mask)?,
            None => centered,
        };
        let var = (centered.sqr()?.sum(2)?.sum(0)? / count)?;
        Ok((mean, var))
    }

    fn schedule_update(&self, running: &Var, batch: &Tensor) -> Result<()> {
        let momentum = self.config.momentum;
        let value = (running.as_tensor().affine(momentum, 0.0)?
            + batch.detach().affine(1.0 - momentum, 0.0)?)?;
        self.updates.push(running.clone(), value);
        Ok(())
    }

    pub fn forward(&self, xs: &Tensor, mask: Option<&Tensor>, train: bool) -> Result<Tensor> {
        let channels = self.weight.dim(0)?;
        let (mean, var) = if train {
            let (mean, var) = self.batch_statistics(xs, mask)?;
            self.schedule_update(&self.running_mean, &mean)?;
            self.schedule_update(&self.running_var, &var)?;
            (mean, var)
        } else {
            (
                self.running_mean.as_tensor().clone(),
                self.running_var.as_tensor().clone(),
            )
        };
        let shape = (1, channels, 1);
        let std = (var + self.config.epsilon)?.sqrt()?.reshape(shape)?;
        xs.broadcast_sub(&mean.reshape(shape)?)?
            .broadcast_div(&std)?
            .broadcast_mul(&self.weight.reshape(shape)?)?
            .broadcast_add(&self.bias.reshape(shape)?)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Activation {
    Relu,
    Tanh,
    Identity,
}

impl Activation {
    fn apply(&self, xs: &Tensor) -> Result<Tensor> {
        match self {
            Self::Relu => xs.relu(),
            Self::Tanh => xs.tanh(),
            Self::Identity => Ok(xs.clone()),
        }
    }
}

/// Length preserving 1D convolution followed by batch norm and an activation.
#[derive(Debug)]
pub struct ConvBlock {
    conv: Conv1d,
    norm: BatchNorm1d,
    activation: Activation,
}

impl ConvBlock {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        activation: Activation,
        norm: NormConfig,
        updates: &UpdateOps,
        vb: VarBuilder,
    ) -> Result<Self> {
        let config = Conv1dConfig {
            padding: kernel_size / 2,
            ..Default::default()
        };
        let conv = conv1d(in_channels, out_channels, kernel_size, config, vb.pp("conv"))?;
        let norm = BatchNorm1d::new(out_channels, norm, updates, vb.pp("norm"))?;
        Ok(Self {
            conv,
            norm,
            activation,
        })
    }

    /// `xs` is `[N, C, T]`, `mask` is `[N, 1, T]`. Padded steps come out as zeros so the next
    /// convolution sees the same thing it would at the real end of the sequence.
    pub fn forward(&self, xs: &Tensor, mask: Option<&Tensor>, train: bool) -> Result<Tensor> {
        let ys = self.conv.forward(xs)?;
        let ys = self.norm.forward(&ys, mask, train)?;
        let ys = self.activation.apply(&ys)?;
        match mask {
            Some(mask) => ys.broadcast_mul(mask),
            None => Ok(ys),
        }
    }
}

/// Convenience for the all-zeros float tensors the decoder starts from.
pub(crate) fn zeros(shape: (usize, usize), device: &Device) -> Result<Tensor> {
    Tensor::zeros(shape, DType::F32, device)
}
