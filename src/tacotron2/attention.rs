//! Location sensitive attention, see [Chorowski et al.](https://arxiv.org/pdf/1506.07503.pdf).
//!
//! Content based attention on its own can skip around or get stuck repeating parts of the input
//! because similar sounding symbols produce similar scores. Adding features computed from where
//! the attention was on the previous step (and where it has been overall) lets the network learn
//! to move forward through the input consistently.
//!
//! The score for encoder step `j` on decoder step `i` is:
//!
//! ```text
//! e[i, j] = v · tanh(W·s[i] + V·h[j] + U·f[i, j])
//! f[i]    = conv([α[i - 1], Σα[..i]])
//! ```
//!
//! Where `s` is the attention LSTM output, `h` the encoder output and `α` the alignment.
use candle_core::{DType, Module, Result, Tensor, D};
use candle_nn::{conv1d_no_bias, linear_no_bias, Conv1d, Conv1dConfig, Linear, VarBuilder};

#[derive(Clone, Copy, Debug)]
pub struct AttentionConfig {
    pub query_dim: usize,
    pub memory_dim: usize,
    pub attention_dim: usize,
    pub location_filters: usize,
    pub location_kernel_size: usize,
}

/// Encoder outputs plus everything about them that stays fixed for a whole decode.
#[derive(Debug)]
pub struct ProcessedMemory {
    /// `[N, T_in, C]` encoder outputs.
    pub values: Tensor,
    /// `[N, T_in, A]` projected keys, computed once rather than on every step.
    pub keys: Tensor,
    /// `[N, T_in]` 1 for real encoder steps and 0 for padding.
    pub mask: Tensor,
}

/// Output of a single attention step.
#[derive(Debug)]
pub struct AttentionStep {
    /// `[N, T_in]` distribution over encoder steps.
    pub alignment: Tensor,
    /// `[N, C]` alignment weighted sum of the encoder outputs.
    pub context: Tensor,
}

#[derive(Debug)]
pub struct LocationSensitiveAttention {
    query_layer: Linear,
    memory_layer: Linear,
    location_conv: Conv1d,
    location_layer: Linear,
    v: Linear,
}

impl LocationSensitiveAttention {
    pub fn new(config: AttentionConfig, vb: VarBuilder) -> Result<Self> {
        let query_layer = linear_no_bias(
            config.query_dim,
            config.attention_dim,
            vb.pp("query_layer"),
        )?;
        let memory_layer = linear_no_bias(
            config.memory_dim,
            config.attention_dim,
            vb.pp("memory_layer"),
        )?;
        let conv_config = Conv1dConfig {
            padding: config.location_kernel_size / 2,
            ..Default::default()
        };
        // Two input channels, the previous and the cumulative alignment
        let location_conv = conv1d_no_bias(
            2,
            config.location_filters,
            config.location_kernel_size,
            conv_config,
            vb.pp("location_conv"),
        )?;
        let location_layer = linear_no_bias(
            config.location_filters,
            config.attention_dim,
            vb.pp("location_layer"),
        )?;
        let v = linear_no_bias(config.attention_dim, 1, vb.pp("v"))?;
        Ok(Self {
            query_layer,
            memory_layer,
            location_conv,
            location_layer,
            v,
        })
    }

    pub fn process_memory(&self, memory: &Tensor, mask: &Tensor) -> Result<ProcessedMemory> {
        let keys = self.memory_layer.forward(memory)?;
        Ok(ProcessedMemory {
            values: memory.clone(),
            keys,
            mask: mask.clone(),
        })
    }

    /// Unnormalised scores `[N, T_in]` with padding set to negative infinity.
    fn energies(
        &self,
        query: &Tensor,
        memory: &ProcessedMemory,
        previous: &Tensor,
        cumulative: &Tensor,
    ) -> Result<Tensor> {
        let query = self.query_layer.forward(query)?.unsqueeze(1)?;
        let location = Tensor::stack(&[previous, cumulative], 1)?;
        let location = self
            .location_conv
            .forward(&location)?
            .transpose(1, 2)?
            .contiguous()?;
        let location = self.location_layer.forward(&location)?;

        let hidden = memory
            .keys
            .broadcast_add(&query)?
            .broadcast_add(&location)?
            .tanh()?;
        let energies = self.v.forward(&hidden)?.squeeze(2)?;

        let keep = memory.mask.to_dtype(DType::U8)?;
        let padding = Tensor::full(f32::NEG_INFINITY, energies.dims(), energies.device())?;
        keep.where_cond(&energies, &padding)
    }

    /// Runs one attention step.
    ///
    /// `previous` and `cumulative` are the last alignment and the running sum of all alignments
    /// so far, both `[N, T_in]`. When `manual` is given it replaces the computed distribution,
    /// this is only meant for poking at a trained model to see what it does when it's forced to
    /// attend somewhere.
    pub fn step(
        &self,
        query: &Tensor,
        memory: &ProcessedMemory,
        previous: &Tensor,
        cumulative: &Tensor,
        manual: Option<&Tensor>,
    ) -> Result<AttentionStep> {
        let alignment = match manual {
            Some(manual) => manual.clone(),
            None => {
                let energies = self.energies(query, memory, previous, cumulative)?;
                candle_nn::ops::softmax(&energies, D::Minus1)?
            }
        };
        let context = alignment
            .unsqueeze(1)?
            .matmul(&memory.values)?
            .squeeze(1)?;
        Ok(AttentionStep { alignment, context })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tacotron2::layers::sequence_mask;
    use candle_core::{Device, IndexOp};
    use candle_nn::VarMap;

    fn attention(device: &Device) -> Result<LocationSensitiveAttention> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        LocationSensitiveAttention::new(
            AttentionConfig {
                query_dim: 6,
                memory_dim: 4,
                attention_dim: 5,
                location_filters: 3,
                location_kernel_size: 3,
            },
            vb,
        )
    }

    #[test]
    fn alignment_is_a_distribution_over_valid_steps() -> Result<()> {
        let device = Device::Cpu;
        let attention = attention(&device)?;
        let memory = Tensor::randn(0f32, 1.0, (2, 5, 4), &device)?;
        let mask = sequence_mask(&[5, 2], 5, &device)?;
        let memory = attention.process_memory(&memory, &mask)?;

        let query = Tensor::randn(0f32, 1.0, (2, 6), &device)?;
        let zeros = Tensor::zeros((2, 5), DType::F32, &device)?;
        let step = attention.step(&query, &memory, &zeros, &zeros, None)?;

        assert_eq!(step.alignment.dims(), &[2, 5]);
        assert_eq!(step.context.dims(), &[2, 4]);
        let sums = step.alignment.sum(1)?.to_vec1::<f32>()?;
        for sum in sums {
            assert!((sum - 1.0).abs() < 1e-5);
        }
        let padded = step.alignment.i((1, 2..))?.sum_all()?.to_scalar::<f32>()?;
        assert_eq!(padded, 0.0);
        Ok(())
    }

    #[test]
    fn uniform_override_averages_memory() -> Result<()> {
        let device = Device::Cpu;
        let attention = attention(&device)?;
        let values = Tensor::randn(0f32, 1.0, (1, 4, 4), &device)?;
        let mask = sequence_mask(&[4], 4, &device)?;
        let memory = attention.process_memory(&values, &mask)?;

        let query = Tensor::randn(0f32, 1.0, (1, 6), &device)?;
        let zeros = Tensor::zeros((1, 4), DType::F32, &device)?;
        let uniform = Tensor::full(0.25f32, (1, 4), &device)?;
        let step = attention.step(&query, &memory, &zeros, &zeros, Some(&uniform))?;

        assert_eq!(step.alignment.to_vec2::<f32>()?, uniform.to_vec2::<f32>()?);
        let expected = values.mean(1)?;
        let diff = (step.context - expected)?
            .abs()?
            .flatten_all()?
            .max(0)?
            .to_scalar::<f32>()?;
        assert!(diff < 1e-6);
        Ok(())
    }
}
