//! Convolution + bidirectional LSTM stacks.
//!
//! The same shape of network is used twice: once as the text encoder (masked by input length)
//! and once to expand the refined mel frames into linear spectrogram frames (no masking, the
//! decoder output is dense).
use super::layers::{Activation, ConvBlock, NormConfig, UpdateOps};
use super::rnn::BiLstm;
use candle_core::{Module, Result, Tensor};
use candle_nn::{linear, Linear, VarBuilder};

#[derive(Clone, Copy, Debug)]
pub struct ConvLstmConfig {
    pub conv_layers: usize,
    pub conv_width: usize,
    pub conv_channels: usize,
    pub lstm_units: usize,
}

#[derive(Debug)]
pub struct ConvLstmStack {
    convs: Vec<ConvBlock>,
    lstm: BiLstm,
}

impl ConvLstmStack {
    pub fn new(
        in_dim: usize,
        config: ConvLstmConfig,
        norm: NormConfig,
        updates: &UpdateOps,
        vb: VarBuilder,
    ) -> Result<Self> {
        let mut convs = Vec::with_capacity(config.conv_layers);
        let mut channels = in_dim;
        for i in 0..config.conv_layers {
            convs.push(ConvBlock::new(
                channels,
                config.conv_channels,
                config.conv_width,
                Activation::Relu,
                norm,
                updates,
                vb.pp(format!("conv_layers.{}", i)),
            )?);
            channels = config.conv_channels;
        }
        let lstm = BiLstm::new(channels, config.lstm_units, vb.pp("lstm"))?;
        Ok(Self { convs, lstm })
    }

    /// `xs` is `[N, T, D]` and `mask` an optional `[N, T]` validity mask, returns `[N, T, 2H]`.
    pub fn forward(&self, xs: &Tensor, mask: Option<&Tensor>, train: bool) -> Result<Tensor> {
        let conv_mask = match mask {
            Some(mask) => Some(mask.unsqueeze(1)?),
            None => None,
        };
        let mut ys = xs.transpose(1, 2)?.contiguous()?;
        if let Some(mask) = &conv_mask {
            ys = ys.broadcast_mul(mask)?;
        }
        for conv in &self.convs {
            ys = conv.forward(&ys, conv_mask.as_ref(), train)?;
        }
        let ys = ys.transpose(1, 2)?.contiguous()?;
        self.lstm.forward(&ys, mask)
    }
}

/// Text encoder: `[N, T_in, E]` embeddings to `[N, T_in, 2 * lstm_units]` context.
#[derive(Debug)]
pub struct Encoder {
    stack: ConvLstmStack,
}

impl Encoder {
    pub fn new(
        embedding_dim: usize,
        config: ConvLstmConfig,
        norm: NormConfig,
        updates: &UpdateOps,
        vb: VarBuilder,
    ) -> Result<Self> {
        let stack = ConvLstmStack::new(embedding_dim, config, norm, updates, vb)?;
        Ok(Self { stack })
    }

    /// Anything past a sequence's length comes out as zeros and never affects the valid steps.
    pub fn forward(&self, embedded: &Tensor, mask: &Tensor, train: bool) -> Result<Tensor> {
        self.stack.forward(embedded, Some(mask), train)
    }
}

/// Maps refined mel frames `[N, T_out, M]` to linear spectrogram frames `[N, T_out, F]`.
#[derive(Debug)]
pub struct Expander {
    stack: ConvLstmStack,
    projection: Linear,
}

impl Expander {
    pub fn new(
        num_mels: usize,
        num_freq: usize,
        config: ConvLstmConfig,
        norm: NormConfig,
        updates: &UpdateOps,
        vb: VarBuilder,
    ) -> Result<Self> {
        let stack = ConvLstmStack::new(num_mels, config, norm, updates, vb.pp("expand"))?;
        let projection = linear(2 * config.lstm_units, num_freq, vb.pp("linear"))?;
        Ok(Self { stack, projection })
    }

    pub fn forward(&self, mel: &Tensor, train: bool) -> Result<Tensor> {
        let expanded = self.stack.forward(mel, None, train)?;
        self.projection.forward(&expanded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tacotron2::layers::sequence_mask;
    use candle_core::{DType, Device, IndexOp};
    use candle_nn::VarMap;

    fn config() -> ConvLstmConfig {
        ConvLstmConfig {
            conv_layers: 2,
            conv_width: 3,
            conv_channels: 6,
            lstm_units: 4,
        }
    }

    fn norm() -> NormConfig {
        NormConfig {
            momentum: 0.99,
            epsilon: 1e-3,
        }
    }

    #[test]
    fn encoder_masks_padded_steps() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let encoder = Encoder::new(5, config(), norm(), &UpdateOps::new(), vb)?;

        let embedded = Tensor::randn(0f32, 1.0, (2, 5, 5), &device)?;
        let mask = sequence_mask(&[5, 3], 5, &device)?;
        let outputs = encoder.forward(&embedded, &mask, false)?;
        assert_eq!(outputs.dims(), &[2, 5, 8]);

        let tail = outputs.i((1, 3.., ..))?.abs()?.sum_all()?.to_scalar::<f32>()?;
        assert_eq!(tail, 0.0);

        // The short sequence encodes the same on its own as it does padded in a batch.
        let alone = encoder.forward(
            &embedded.i((1..2, 0..3, ..))?,
            &sequence_mask(&[3], 3, &device)?,
            false,
        )?;
        let diff = (alone - outputs.i((1..2, 0..3, ..))?)?
            .abs()?
            .flatten_all()?
            .max(0)?
            .to_scalar::<f32>()?;
        assert!(diff < 1e-5, "max diff {}", diff);
        Ok(())
    }

    #[test]
    fn expander_projects_to_linear_bins() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let updates = UpdateOps::new();
        let expander = Expander::new(4, 9, config(), norm(), &updates, vb)?;

        let mel = Tensor::randn(0f32, 1.0, (2, 10, 4), &device)?;
        let linear = expander.forward(&mel, true)?;
        assert_eq!(linear.dims(), &[2, 10, 9]);
        // Two conv blocks each scheduling a mean and a variance update.
        assert_eq!(updates.len(), 4);
        Ok(())
    }
}
