//! Reconstruction and guided attention losses.
use crate::error::{Error, Result};
use crate::hparams::Hyperparameters;
use crate::tacotron2::ModelOutputs;
use candle_core::{Device, Tensor};
use ndarray::Array2;
use serde::Serialize;

/// Value marking alignment entries that don't exist (past `T_in` or the decoder steps).
const MISSING: f32 = -1.0;

/// Guided attention prior from [Tachibana et al.](https://arxiv.org/abs/1710.08969), page 3.
///
/// `W[n, t] = 1 - exp(-(t / max_t - n / max_n)^2 / (2g^2))`
///
/// Zero on the diagonal and approaching one away from it, so multiplying an alignment with it
/// measures how much attention went somewhere a monotonic reading of the text wouldn't put it.
pub fn guided_attention(max_n: usize, max_t: usize, g: f64) -> Array2<f32> {
    Array2::from_shape_fn((max_n, max_t), |(n, t)| {
        let offset = t as f64 / max_t as f64 - n as f64 / max_n as f64;
        (1.0 - (-offset.powi(2) / (2.0 * g * g)).exp()) as f32
    })
}

/// Mean absolute error.
pub fn l1_loss(outputs: &Tensor, targets: &Tensor) -> candle_core::Result<Tensor> {
    (targets - outputs)?.abs()?.mean_all()
}

/// Half the L1 error over every frequency bin plus half over the first `n_priority_freq` bins,
/// so the low frequencies where most of the intelligibility lives count double.
pub fn priority_linear_loss(
    outputs: &Tensor,
    targets: &Tensor,
    n_priority_freq: usize,
) -> candle_core::Result<Tensor> {
    let l1 = (targets - outputs)?.abs()?;
    let full = l1.mean_all()?;
    if n_priority_freq == 0 {
        return full.affine(0.5, 0.0);
    }
    let priority = l1.narrow(2, 0, n_priority_freq)?.mean_all()?;
    (full.affine(0.5, 0.0)? + priority.affine(0.5, 0.0)?)
}

/// Sum of `|alignment * W|` over the entries that exist, divided by the batch size.
///
/// The `[N, T_in, steps]` alignments are padded with [`MISSING`] and cropped to the
/// `[max_n, max_t]` window of the prior, the padding is then masked out.
pub fn guided_attention_loss(alignments: &Tensor, prior: &Tensor) -> candle_core::Result<Tensor> {
    let (batch, input_len, steps) = alignments.dims3()?;
    let (max_n, max_t) = prior.dims2()?;
    let device = alignments.device();

    let padded = Tensor::cat(
        &[
            alignments,
            &Tensor::full(MISSING, (batch, input_len, max_t), device)?,
        ],
        2,
    )?;
    let padded = Tensor::cat(
        &[
            &padded,
            &Tensor::full(MISSING, (batch, max_n, steps + max_t), device)?,
        ],
        1,
    )?
    .narrow(1, 0, max_n)?
    .narrow(2, 0, max_t)?;

    let mask = padded.ne(MISSING)?.to_dtype(padded.dtype())?;
    let guided = padded.broadcast_mul(prior)?.abs()?.mul(&mask)?;
    guided.sum_all()? / batch as f64
}

/// Loss scalars copied off the device, handy for logging.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct LossScalars {
    pub decoder: f32,
    pub mel: f32,
    pub linear: f32,
    pub attention: f32,
    pub total: f32,
}

/// All the loss terms of a forward pass, each a scalar tensor.
#[derive(Clone, Debug)]
pub struct Losses {
    /// L1 between the mel targets and the raw decoder output
    pub decoder: Tensor,
    /// L1 between the mel targets and the postnet refined output
    pub mel: Tensor,
    /// Frequency prioritised L1 on the linear spectrogram
    pub linear: Tensor,
    /// Guided attention penalty, only part of `total` when its weight is non-zero
    pub attention: Tensor,
    /// What the optimiser minimises
    pub total: Tensor,
}

impl Losses {
    pub fn scalars(&self) -> Result<LossScalars> {
        Ok(LossScalars {
            decoder: self.decoder.to_scalar::<f32>()?,
            mel: self.mel.to_scalar::<f32>()?,
            linear: self.linear.to_scalar::<f32>()?,
            attention: self.attention.to_scalar::<f32>()?,
            total: self.total.to_scalar::<f32>()?,
        })
    }
}

/// Computes [`Losses`] from training outputs. The guided attention prior only depends on the
/// hyperparameters so it's built once here.
#[derive(Debug)]
pub struct LossModule {
    prior: Tensor,
    n_priority_freq: usize,
    attention_weight: f64,
}

impl LossModule {
    pub fn new(hparams: &Hyperparameters, device: &Device) -> Result<Self> {
        let prior = guided_attention(hparams.max_n, hparams.max_t, hparams.guided_attention_g);
        let prior = Tensor::from_vec(
            prior.into_raw_vec(),
            (hparams.max_n, hparams.max_t),
            device,
        )?;
        Ok(Self {
            prior,
            n_priority_freq: hparams.n_priority_freq(),
            attention_weight: hparams.guided_attention_weight,
        })
    }

    /// Fails with [`Error::MissingTargets`] unless `outputs` came from a training forward pass.
    pub fn compute(&self, outputs: &ModelOutputs) -> Result<Losses> {
        let targets = outputs.targets.as_ref().ok_or(Error::MissingTargets)?;

        let decoder = l1_loss(&outputs.decoder_outputs, &targets.mel)?;
        let mel = l1_loss(&outputs.mel_outputs, &targets.mel)?;
        let linear = priority_linear_loss(
            &outputs.linear_outputs,
            &targets.linear,
            self.n_priority_freq,
        )?;
        let attention = guided_attention_loss(&outputs.alignments, &self.prior)?;

        let mut total = ((&decoder + &mel)? + &linear)?;
        if self.attention_weight != 0.0 {
            total = (total + attention.affine(self.attention_weight, 0.0)?)?;
        }
        Ok(Losses {
            decoder,
            mel,
            linear,
            attention,
            total,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tacotron2::tests::{tiny_model, training_batch};
    use crate::tacotron2::Batch;
    use candle_core::DType;

    #[test]
    fn prior_is_zero_on_the_diagonal() {
        let w = guided_attention(90, 200, 0.2);
        assert_eq!(w.dim(), (90, 200));
        assert_eq!(w[[0, 0]], 0.0);
        assert_eq!(w[[45, 100]], 0.0);
        assert!(w.iter().all(|x| (0.0..1.0).contains(x)));

        let expected = 1.0 - (-(0.5f64 - 10.0 / 90.0).powi(2) / 0.08).exp();
        assert!((w[[10, 100]] as f64 - expected).abs() < 1e-6);
    }

    #[test]
    fn priority_bins_count_double() -> Result<()> {
        let device = Device::Cpu;
        let hparams = Hyperparameters {
            sample_rate: 20000,
            num_freq: 512,
            ..Default::default()
        };
        let n_priority = hparams.n_priority_freq();
        assert_eq!(n_priority, 102);

        let outputs = Tensor::zeros((1, 2, 512), DType::F32, &device)?;
        let everywhere = Tensor::ones((1, 2, 512), DType::F32, &device)?;
        let loss = priority_linear_loss(&outputs, &everywhere, n_priority)?.to_scalar::<f32>()?;
        assert!((loss - 1.0).abs() < 1e-6);

        // Only the high bins are wrong, they only get the 0.5 weight.
        let high = Tensor::cat(
            &[
                &Tensor::zeros((1, 2, 102), DType::F32, &device)?,
                &Tensor::ones((1, 2, 410), DType::F32, &device)?,
            ],
            2,
        )?;
        let loss = priority_linear_loss(&outputs, &high, n_priority)?.to_scalar::<f32>()?;
        assert!((loss - 0.5 * 410.0 / 512.0).abs() < 1e-6);

        // Only the low bins are wrong, they get 0.5 from the full mean and 0.5 from the
        // priority mean.
        let low = Tensor::cat(
            &[
                &Tensor::ones((1, 2, 102), DType::F32, &device)?,
                &Tensor::zeros((1, 2, 410), DType::F32, &device)?,
            ],
            2,
        )?;
        let loss = priority_linear_loss(&outputs, &low, n_priority)?.to_scalar::<f32>()?;
        assert!((loss - (0.5 * 102.0 / 512.0 + 0.5)).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn guided_loss_only_counts_existing_entries() -> Result<()> {
        let device = Device::Cpu;
        let w = guided_attention(4, 5, 0.2);
        let prior = Tensor::from_vec(w.clone().into_raw_vec(), (4, 5), &device)?;

        let alignments = Tensor::ones((2, 2, 3), DType::F32, &device)?;
        let loss = guided_attention_loss(&alignments, &prior)?.to_scalar::<f32>()?;
        let expected: f32 = (0..2)
            .flat_map(|n| (0..3).map(move |t| (n, t)))
            .map(|(n, t)| w[[n, t]])
            .sum();
        // Two identical sequences, divided by the batch size.
        assert!((loss - expected).abs() < 1e-6);

        // Bigger than the window gets cropped.
        let alignments = Tensor::ones((1, 6, 9), DType::F32, &device)?;
        let loss = guided_attention_loss(&alignments, &prior)?.to_scalar::<f32>()?;
        assert!((loss - w.sum()).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn total_leaves_out_attention_by_default() -> Result<()> {
        let hparams = Hyperparameters::tiny();
        let (_, model) = tiny_model(&hparams);
        let outputs = model.forward(&training_batch(&hparams, 10))?;
        let losses = LossModule::new(&hparams, &Device::Cpu)?.compute(&outputs)?;
        let scalars = losses.scalars()?;
        let sum = scalars.decoder + scalars.mel + scalars.linear;
        assert!((scalars.total - sum).abs() < 1e-5);
        assert!(scalars.attention >= 0.0);

        let weighted = Hyperparameters {
            guided_attention_weight: 2.0,
            ..hparams
        };
        let losses = LossModule::new(&weighted, &Device::Cpu)?.compute(&outputs)?;
        let scalars = losses.scalars()?;
        let sum = scalars.decoder + scalars.mel + scalars.linear + 2.0 * scalars.attention;
        assert!((scalars.total - sum).abs() < 1e-4);
        Ok(())
    }

    #[test]
    fn loss_needs_training_outputs() -> Result<()> {
        let hparams = Hyperparameters::tiny();
        let (_, model) = tiny_model(&hparams);
        let inputs = Tensor::new(&[[1u32, 2]], &Device::Cpu)?;
        let outputs = model.forward(&Batch::inference(inputs, vec![2]))?;
        let result = LossModule::new(&hparams, &Device::Cpu)?.compute(&outputs);
        assert!(matches!(result, Err(Error::MissingTargets)));
        Ok(())
    }
}
