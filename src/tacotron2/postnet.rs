//! The postnet predicts a residual that's added to the decoder output. The decoder only ever
//! sees the past, the postnet runs once the whole spectrogram exists so it can use context from
//! both directions to clean it up.
use super::layers::{Activation, ConvBlock, NormConfig, UpdateOps};
use candle_core::{Result, Tensor};
use candle_nn::VarBuilder;

#[derive(Clone, Copy, Debug)]
pub struct PostnetConfig {
    pub layers: usize,
    pub conv_width: usize,
    pub channels: usize,
}

#[derive(Debug)]
pub struct Postnet {
    convs: Vec<ConvBlock>,
}

impl Postnet {
    pub fn new(
        num_mels: usize,
        config: PostnetConfig,
        norm: NormConfig,
        updates: &UpdateOps,
        vb: VarBuilder,
    ) -> Result<Self> {
        let mut convs = Vec::with_capacity(config.layers);
        for i in 0..config.layers {
            let first = i == 0;
            let last = i + 1 == config.layers;
            let in_channels = if first { num_mels } else { config.channels };
            let (out_channels, activation) = if last {
                (num_mels, Activation::Identity)
            } else {
                (config.channels, Activation::Tanh)
            };
            convs.push(ConvBlock::new(
                in_channels,
                out_channels,
                config.conv_width,
                activation,
                norm,
                updates,
                vb.pp(format!("conv_layers.{}", i)),
            )?);
        }
        Ok(Self { convs })
    }

    /// Residual for `[N, T_out, M]` decoder frames, same shape as the input.
    pub fn forward(&self, decoder_outputs: &Tensor, train: bool) -> Result<Tensor> {
        let mut xs = decoder_outputs.transpose(1, 2)?.contiguous()?;
        for conv in &self.convs {
            xs = conv.forward(&xs, None, train)?;
        }
        xs.transpose(1, 2)?.contiguous()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn residual_matches_input_shape() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let postnet = Postnet::new(
            4,
            PostnetConfig {
                layers: 3,
                conv_width: 5,
                channels: 8,
            },
            NormConfig {
                momentum: 0.99,
                epsilon: 1e-3,
            },
            &UpdateOps::new(),
            vb,
        )?;
        let frames = Tensor::randn(0f32, 1.0, (2, 15, 4), &device)?;
        let residual = postnet.forward(&frames, false)?;
        assert_eq!(residual.dims(), frames.dims());
        Ok(())
    }
}
