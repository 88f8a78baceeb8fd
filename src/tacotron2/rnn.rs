//! Bidirectional LSTM that respects per-sequence lengths.
//!
//! Candle's LSTM runs every row of a batch for the full padded length. For the encoder that
//! would let padding leak into the backward direction (it would start at the padded end of the
//! sequence) so we step manually and freeze the state of any row that's past its length. The
//! backward direction therefore starts from a zero state at each sequence's real last step,
//! which is what packed sequences do in other frameworks.
use candle_core::{Result, Tensor};
use candle_nn::rnn::{lstm, Direction, LSTMConfig, LSTMState, LSTM, RNN};
use candle_nn::VarBuilder;

/// Runs one LSTM step, keeping the previous state for rows the mask marks as padding. The
/// returned output is zero for those rows.
pub(crate) fn masked_step(
    cell: &LSTM,
    input: &Tensor,
    state: &LSTMState,
    mask: Option<&Tensor>,
) -> Result<(Tensor, LSTMState)> {
    let next = cell.step(input, state)?;
    match mask {
        None => Ok((next.h.clone(), next)),
        Some(mask) => {
            let keep = mask.affine(-1.0, 1.0)?;
            let h = (next.h.broadcast_mul(mask)? + state.h.broadcast_mul(&keep)?)?;
            let c = (next.c.broadcast_mul(mask)? + state.c.broadcast_mul(&keep)?)?;
            let output = next.h.broadcast_mul(mask)?;
            Ok((output, LSTMState::new(h, c)))
        }
    }
}

#[derive(Debug)]
pub struct BiLstm {
    forward: LSTM,
    backward: LSTM,
}

impl BiLstm {
    pub fn new(in_dim: usize, hidden_dim: usize, vb: VarBuilder) -> Result<Self> {
        let forward = lstm(in_dim, hidden_dim, LSTMConfig::default(), vb.clone())?;
        let backward = lstm(
            in_dim,
            hidden_dim,
            LSTMConfig {
                direction: Direction::Backward,
                ..Default::default()
            },
            vb,
        )?;
        Ok(Self { forward, backward })
    }

    /// `xs` is `[N, T, D]` and `mask` an optional `[N, T]` validity mask. Returns `[N, T, 2H]`
    /// with the forward outputs first and the backward outputs second.
    pub fn forward(&self, xs: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        let (batch, time, _) = xs.dims3()?;
        let inputs = (0..time)
            .map(|t| xs.narrow(1, t, 1)?.squeeze(1)?.contiguous())
            .collect::<Result<Vec<_>>>()?;
        let masks = match mask {
            Some(mask) => Some(
                (0..time)
                    .map(|t| mask.narrow(1, t, 1))
                    .collect::<Result<Vec<_>>>()?,
            ),
            None => None,
        };

        let mut state = self.forward.zero_state(batch)?;
        let mut forward_outputs = Vec::with_capacity(time);
        for (t, input) in inputs.iter().enumerate() {
            let (output, next) = masked_step(
                &self.forward,
                input,
                &state,
                masks.as_ref().map(|m| &m[t]),
            )?;
            forward_outputs.push(output);
            state = next;
        }

        let mut state = self.backward.zero_state(batch)?;
        let mut backward_outputs = Vec::with_capacity(time);
        for (t, input) in inputs.iter().enumerate().rev() {
            let (output, next) = masked_step(
                &self.backward,
                input,
                &state,
                masks.as_ref().map(|m| &m[t]),
            )?;
            backward_outputs.push(output);
            state = next;
        }
        backward_outputs.reverse();

        let forward = Tensor::stack(&forward_outputs, 1)?;
        let backward = Tensor::stack(&backward_outputs, 1)?;
        Tensor::cat(&[&forward, &backward], 2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tacotron2::layers::sequence_mask;
    use candle_core::{DType, Device, IndexOp};
    use candle_nn::VarMap;

    #[test]
    fn padding_does_not_leak_into_valid_steps() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let rnn = BiLstm::new(3, 4, vb)?;

        let valid = Tensor::randn(0f32, 1.0, (1, 2, 3), &device)?;
        let garbage = Tensor::randn(0f32, 10.0, (1, 3, 3), &device)?;
        let padded = Tensor::cat(&[&valid, &garbage], 1)?;
        let mask = sequence_mask(&[2], 5, &device)?;

        let alone = rnn.forward(&valid, None)?;
        let batched = rnn.forward(&padded, Some(&mask))?;
        assert_eq!(batched.dims(), &[1, 5, 8]);

        let diff = (alone - batched.i((.., 0..2, ..))?)?
            .abs()?
            .flatten_all()?
            .max(0)?
            .to_scalar::<f32>()?;
        assert!(diff < 1e-5, "max diff {}", diff);

        let tail = batched.i((.., 2.., ..))?.abs()?.sum_all()?.to_scalar::<f32>()?;
        assert_eq!(tail, 0.0);
        Ok(())
    }
}
