//! Autoregressive decoder.
//!
//! Every step takes the previous mel frame through the prenet, updates the attention LSTM,
//! attends over the encoder output, runs the two decoder LSTMs on the attention LSTM output
//! concatenated with the context and finally projects to `outputs_per_step` mel frames at once.
//!
//! What "the previous mel frame" is depends on the [`Helper`]. When training we have the target
//! spectrogram so we feed the ground truth (teacher forcing) and know exactly how many steps to
//! run. At inference we feed back our own prediction and have to guess when to stop, either the
//! output goes silent or we hit `max_iters`.
use super::attention::{AttentionConfig, LocationSensitiveAttention, ProcessedMemory};
use super::layers::zeros;
use candle_core::{Device, Module, Result, Tensor};
use candle_nn::rnn::{lstm, LSTMConfig, LSTMState, LSTM, RNN};
use candle_nn::{linear, Linear, VarBuilder};
use tracing::debug;

#[derive(Debug)]
pub struct Prenet {
    layers: Vec<Linear>,
    dropout: f32,
    output_dim: usize,
}

impl Prenet {
    pub fn new(in_dim: usize, depths: &[usize], dropout: f32, vb: VarBuilder) -> Result<Self> {
        let mut layers = Vec::with_capacity(depths.len());
        let mut dim = in_dim;
        for (i, depth) in depths.iter().enumerate() {
            layers.push(linear(dim, *depth, vb.pp(format!("layers.{}", i)))?);
            dim = *depth;
        }
        Ok(Self {
            layers,
            dropout,
            output_dim: dim,
        })
    }

    pub fn output_dim(&self) -> usize {
        self.output_dim
    }

    pub fn forward(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let mut xs = xs.clone();
        for layer in &self.layers {
            xs = layer.forward(&xs)?.relu()?;
            if train && self.dropout > 0.0 {
                xs = candle_nn::ops::dropout(&xs, self.dropout)?;
            }
        }
        Ok(xs)
    }
}

/// Why the decode loop finished.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    /// Teacher forcing ran out of target frames.
    TargetsExhausted,
    /// The self-fed output went quiet.
    Silence,
    /// Hit the `max_iters` ceiling without the output going quiet.
    MaxIters,
}

/// Chooses what's fed into the decoder on each step.
#[derive(Debug)]
pub enum Helper<'a> {
    /// Feed the ground truth frame preceding each step.
    TeacherForcing {
        /// `[N, T_out, M]` target mel frames.
        targets: &'a Tensor,
        outputs_per_step: usize,
        num_mels: usize,
    },
    /// Feed back the last frame we predicted.
    SelfFeed {
        max_iters: usize,
        stop_threshold: f32,
        outputs_per_step: usize,
        num_mels: usize,
    },
}

impl<'a> Helper<'a> {
    /// Total decoder steps this helper allows, the loop never runs past this.
    pub fn max_steps(&self) -> Result<usize> {
        match self {
            Self::TeacherForcing {
                targets,
                outputs_per_step,
                ..
            } => Ok(targets.dim(1)? / outputs_per_step),
            Self::SelfFeed { max_iters, .. } => Ok(*max_iters),
        }
    }

    fn num_mels(&self) -> usize {
        match self {
            Self::TeacherForcing { num_mels, .. } | Self::SelfFeed { num_mels, .. } => *num_mels,
        }
    }

    /// The all zeros "go" frame fed on the first step.
    pub fn initial_input(&self, batch_size: usize, device: &Device) -> Result<Tensor> {
        zeros((batch_size, self.num_mels()), device)
    }

    /// Frame to feed on step `step + 1` given the `[N, M * r]` output of step `step`.
    pub fn next_input(&self, output: &Tensor, step: usize) -> Result<Tensor> {
        match self {
            Self::TeacherForcing {
                targets,
                outputs_per_step,
                ..
            } => {
                let frame = outputs_per_step * (step + 1) - 1;
                targets.narrow(1, frame, 1)?.squeeze(1)?.contiguous()
            }
            Self::SelfFeed {
                outputs_per_step,
                num_mels,
                ..
            } => output
                .narrow(1, (outputs_per_step - 1) * num_mels, *num_mels)?
                .contiguous(),
        }
    }

    /// Whether the last frame of every sequence in the batch is below the stop threshold. Only
    /// self feeding ever stops this way.
    pub fn is_silent(&self, output: &Tensor) -> Result<bool> {
        match self {
            Self::TeacherForcing { .. } => Ok(false),
            Self::SelfFeed {
                stop_threshold,
                outputs_per_step,
                num_mels,
                ..
            } => {
                let last = output.narrow(1, (outputs_per_step - 1) * num_mels, *num_mels)?;
                let loudest = last.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?;
                Ok(loudest < *stop_threshold)
            }
        }
    }

    /// Reason to report when the loop ran for all of [`Helper::max_steps`].
    fn exhausted(&self) -> StopReason {
        match self {
            Self::TeacherForcing { .. } => StopReason::TargetsExhausted,
            Self::SelfFeed { .. } => StopReason::MaxIters,
        }
    }
}

/// Reshapes grouped decoder output `[N, T_out / r, M * r]` into one frame per row
/// `[N, T_out, M]`. Frame `r * k + j` is columns `j * M..(j + 1) * M` of group `k`.
pub fn ungroup_frames(grouped: &Tensor, num_mels: usize) -> Result<Tensor> {
    let (batch, steps, width) = grouped.dims3()?;
    grouped.reshape((batch, steps * width / num_mels, num_mels))
}

/// Everything the decoder carries from one step to the next. Zeroed at the start of a decode
/// and dropped at the end apart from the alignments which are stacked into the output.
struct DecoderState {
    /// Hidden and cell state of the attention LSTM
    attention_rnn: LSTMState,
    /// Context vector from the last attention step, fed back into the attention LSTM
    context: Tensor,
    /// Alignment from the last step
    alignment: Tensor,
    /// Sum of every alignment so far
    cumulative_alignment: Tensor,
    /// States of the stacked decoder LSTMs, bottom first
    decoder_rnns: Vec<LSTMState>,
}

#[derive(Debug)]
pub struct DecoderOutput {
    /// `[N, steps * r, M]`
    pub frames: Tensor,
    /// `[N, T_in, steps]`
    pub alignments: Tensor,
    pub steps: usize,
    pub stop_reason: StopReason,
}

#[derive(Clone, Debug)]
pub struct DecoderConfig {
    pub num_mels: usize,
    pub outputs_per_step: usize,
    pub encoder_dim: usize,
    pub prenet_depths: Vec<usize>,
    pub prenet_dropout: f32,
    pub attention_rnn_units: usize,
    pub attention_depth: usize,
    pub location_filters: usize,
    pub location_kernel_size: usize,
    pub decoder_rnn_units: usize,
}

#[derive(Debug)]
pub struct Decoder {
    prenet: Prenet,
    attention_rnn: LSTM,
    attention: LocationSensitiveAttention,
    decoder_rnns: Vec<LSTM>,
    projection: Linear,
    num_mels: usize,
    encoder_dim: usize,
}

impl Decoder {
    pub fn new(config: &DecoderConfig, vb: VarBuilder) -> Result<Self> {
        let prenet = Prenet::new(
            config.num_mels,
            &config.prenet_depths,
            config.prenet_dropout,
            vb.pp("prenet"),
        )?;
        let attention_rnn = lstm(
            prenet.output_dim() + config.encoder_dim,
            config.attention_rnn_units,
            LSTMConfig::default(),
            vb.pp("attention_rnn"),
        )?;
        let attention = LocationSensitiveAttention::new(
            AttentionConfig {
                query_dim: config.attention_rnn_units,
                memory_dim: config.encoder_dim,
                attention_dim: config.attention_depth,
                location_filters: config.location_filters,
                location_kernel_size: config.location_kernel_size,
            },
            vb.pp("attention"),
        )?;
        let decoder_rnns = vec![
            lstm(
                config.attention_rnn_units + config.encoder_dim,
                config.decoder_rnn_units,
                LSTMConfig::default(),
                vb.pp("decoder_rnns.0"),
            )?,
            lstm(
                config.decoder_rnn_units,
                config.decoder_rnn_units,
                LSTMConfig::default(),
                vb.pp("decoder_rnns.1"),
            )?,
        ];
        let projection = linear(
            config.decoder_rnn_units,
            config.num_mels * config.outputs_per_step,
            vb.pp("projection"),
        )?;
        Ok(Self {
            prenet,
            attention_rnn,
            attention,
            decoder_rnns,
            projection,
            num_mels: config.num_mels,
            encoder_dim: config.encoder_dim,
        })
    }

    fn initial_state(
        &self,
        batch_size: usize,
        input_len: usize,
        device: &Device,
    ) -> Result<DecoderState> {
        Ok(DecoderState {
            attention_rnn: self.attention_rnn.zero_state(batch_size)?,
            context: zeros((batch_size, self.encoder_dim), device)?,
            alignment: zeros((batch_size, input_len), device)?,
            cumulative_alignment: zeros((batch_size, input_len), device)?,
            decoder_rnns: self
                .decoder_rnns
                .iter()
                .map(|rnn| rnn.zero_state(batch_size))
                .collect::<Result<Vec<_>>>()?,
        })
    }

    /// One decoder step, returns the `[N, M * r]` output and updates `state` in place.
    fn step(
        &self,
        input: &Tensor,
        memory: &ProcessedMemory,
        state: &mut DecoderState,
        manual: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        let prenet = self.prenet.forward(input, train)?;
        let rnn_input = Tensor::cat(&[&prenet, &state.context], 1)?;
        state.attention_rnn = self.attention_rnn.step(&rnn_input, &state.attention_rnn)?;
        let query = state.attention_rnn.h.clone();

        let attended = self.attention.step(
            &query,
            memory,
            &state.alignment,
            &state.cumulative_alignment,
            manual,
        )?;
        state.cumulative_alignment = (&state.cumulative_alignment + &attended.alignment)?;
        state.alignment = attended.alignment;
        state.context = attended.context;

        let mut hidden = Tensor::cat(&[&query, &state.context], 1)?;
        for (rnn, rnn_state) in self.decoder_rnns.iter().zip(state.decoder_rnns.iter_mut()) {
            *rnn_state = rnn.step(&hidden, rnn_state)?;
            hidden = rnn_state.h.clone();
        }
        self.projection.forward(&hidden)
    }

    /// Runs the decode loop to completion.
    ///
    /// `memory` is the encoder output `[N, T_in, C]` and `mask` the `[N, T_in]` validity mask.
    /// `manual` is an optional `[N, S, T_in]` alignment override, row `k` replaces the computed
    /// alignment on step `k` and steps past `S` use the computed alignment again.
    pub fn decode(
        &self,
        memory: &Tensor,
        mask: &Tensor,
        helper: &Helper,
        manual: Option<&Tensor>,
        train: bool,
    ) -> Result<DecoderOutput> {
        let (batch_size, input_len, _) = memory.dims3()?;
        let device = memory.device();
        let memory = self.attention.process_memory(memory, mask)?;
        let manual_steps = match manual {
            Some(manual) => manual.dim(1)?,
            None => 0,
        };

        let max_steps = helper.max_steps()?;
        let mut state = self.initial_state(batch_size, input_len, device)?;
        let mut input = helper.initial_input(batch_size, device)?;
        let mut outputs = Vec::with_capacity(max_steps);
        let mut alignments = Vec::with_capacity(max_steps);
        let mut stop_reason = helper.exhausted();

        for step in 0..max_steps {
            let forced = match manual {
                Some(manual) if step < manual_steps => {
                    Some(manual.narrow(1, step, 1)?.squeeze(1)?.contiguous()?)
                }
                _ => None,
            };
            let output = self.step(&input, &memory, &mut state, forced.as_ref(), train)?;
            alignments.push(state.alignment.clone());

            if helper.is_silent(&output)? {
                outputs.push(output);
                stop_reason = StopReason::Silence;
                break;
            }
            input = helper.next_input(&output, step)?;
            outputs.push(output);
        }
        let steps = outputs.len();
        debug!("Decoder stopped after {} steps: {:?}", steps, stop_reason);

        let grouped = Tensor::stack(&outputs, 1)?;
        Ok(DecoderOutput {
            frames: ungroup_frames(&grouped, self.num_mels)?,
            alignments: Tensor::stack(&alignments, 2)?,
            steps,
            stop_reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tacotron2::layers::sequence_mask;
    use candle_core::{DType, IndexOp};
    use candle_nn::VarMap;

    fn config() -> DecoderConfig {
        DecoderConfig {
            num_mels: 3,
            outputs_per_step: 5,
            encoder_dim: 4,
            prenet_depths: vec![6, 5],
            prenet_dropout: 0.5,
            attention_rnn_units: 6,
            attention_depth: 5,
            location_filters: 2,
            location_kernel_size: 3,
            decoder_rnn_units: 7,
        }
    }

    #[test]
    fn ungrouping_preserves_frame_order() -> Result<()> {
        let device = Device::Cpu;
        let (batch, steps, mels, r) = (2, 3, 4, 5);
        let grouped = Tensor::arange(0f32, (batch * steps * mels * r) as f32, &device)?
            .reshape((batch, steps, mels * r))?;
        let frames = ungroup_frames(&grouped, mels)?;
        assert_eq!(frames.dims(), &[batch, steps * r, mels]);

        for n in 0..batch {
            for k in 0..steps {
                for j in 0..r {
                    let frame = frames.i((n, r * k + j))?.to_vec1::<f32>()?;
                    let group = grouped
                        .i((n, k))?
                        .narrow(0, j * mels, mels)?
                        .to_vec1::<f32>()?;
                    assert_eq!(frame, group);
                }
            }
        }
        Ok(())
    }

    #[test]
    fn teacher_forcing_feeds_previous_target_frame() -> Result<()> {
        let device = Device::Cpu;
        let targets = Tensor::arange(0f32, 60.0, &device)?.reshape((1, 20, 3))?;
        let helper = Helper::TeacherForcing {
            targets: &targets,
            outputs_per_step: 5,
            num_mels: 3,
        };
        assert_eq!(helper.max_steps()?, 4);
        let output = Tensor::zeros((1, 15), DType::F32, &device)?;
        let next = helper.next_input(&output, 0)?;
        assert_eq!(next.to_vec2::<f32>()?, vec![vec![12.0, 13.0, 14.0]]);
        let next = helper.next_input(&output, 2)?;
        assert_eq!(next.to_vec2::<f32>()?, vec![vec![42.0, 43.0, 44.0]]);
        assert!(!helper.is_silent(&output)?);
        Ok(())
    }

    #[test]
    fn self_feed_uses_last_predicted_frame() -> Result<()> {
        let device = Device::Cpu;
        let helper = Helper::SelfFeed {
            max_iters: 10,
            stop_threshold: 0.5,
            outputs_per_step: 2,
            num_mels: 3,
        };
        let output = Tensor::new(&[[1f32, 2.0, 3.0, 0.1, -0.2, 0.3]], &device)?;
        assert_eq!(
            helper.next_input(&output, 0)?.to_vec2::<f32>()?,
            vec![vec![0.1, -0.2, 0.3]]
        );
        assert!(helper.is_silent(&output)?);

        let loud = Tensor::new(&[[0f32, 0.0, 0.0, 0.1, -0.9, 0.3]], &device)?;
        assert!(!helper.is_silent(&loud)?);
        Ok(())
    }

    #[test]
    fn training_runs_one_step_per_group() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let decoder = Decoder::new(&config(), vb)?;

        let memory = Tensor::randn(0f32, 1.0, (2, 6, 4), &device)?;
        let mask = sequence_mask(&[6, 4], 6, &device)?;
        let targets = Tensor::randn(0f32, 1.0, (2, 20, 3), &device)?;
        let helper = Helper::TeacherForcing {
            targets: &targets,
            outputs_per_step: 5,
            num_mels: 3,
        };
        let output = decoder.decode(&memory, &mask, &helper, None, true)?;
        assert_eq!(output.steps, 4);
        assert_eq!(output.stop_reason, StopReason::TargetsExhausted);
        assert_eq!(output.frames.dims(), &[2, 20, 3]);
        assert_eq!(output.alignments.dims(), &[2, 6, 4]);
        Ok(())
    }

    #[test]
    fn inference_stops_at_max_iters() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let decoder = Decoder::new(&config(), vb)?;

        let memory = Tensor::randn(0f32, 1.0, (1, 4, 4), &device)?;
        let mask = sequence_mask(&[4], 4, &device)?;
        // A zero threshold can never be undercut so only the cap can end the loop.
        let helper = Helper::SelfFeed {
            max_iters: 100,
            stop_threshold: 0.0,
            outputs_per_step: 5,
            num_mels: 3,
        };
        let output = decoder.decode(&memory, &mask, &helper, None, false)?;
        assert_eq!(output.steps, 100);
        assert_eq!(output.stop_reason, StopReason::MaxIters);
        assert_eq!(output.frames.dims(), &[1, 500, 3]);
        assert_eq!(output.alignments.dims(), &[1, 4, 100]);
        Ok(())
    }

    #[test]
    fn inference_stops_on_silence() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let decoder = Decoder::new(&config(), vb)?;

        let memory = Tensor::randn(0f32, 1.0, (1, 4, 4), &device)?;
        let mask = sequence_mask(&[4], 4, &device)?;
        // Everything is quieter than infinity so the first step already counts as silence.
        let helper = Helper::SelfFeed {
            max_iters: 100,
            stop_threshold: f32::INFINITY,
            outputs_per_step: 5,
            num_mels: 3,
        };
        let output = decoder.decode(&memory, &mask, &helper, None, false)?;
        assert_eq!(output.steps, 1);
        assert_eq!(output.stop_reason, StopReason::Silence);
        Ok(())
    }

    #[test]
    fn manual_alignment_replaces_computed_rows() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let decoder = Decoder::new(&config(), vb)?;

        let memory = Tensor::randn(0f32, 1.0, (1, 4, 4), &device)?;
        let mask = sequence_mask(&[4], 4, &device)?;
        let helper = Helper::SelfFeed {
            max_iters: 3,
            stop_threshold: 0.0,
            outputs_per_step: 5,
            num_mels: 3,
        };
        let forced = Tensor::new(&[[[0f32, 0.0, 1.0, 0.0], [0.0, 0.0, 0.0, 1.0]]], &device)?;
        let output = decoder.decode(&memory, &mask, &helper, Some(&forced), false)?;

        let alignments = output.alignments.squeeze(0)?.t()?.to_vec2::<f32>()?;
        assert_eq!(alignments[0], vec![0.0, 0.0, 1.0, 0.0]);
        assert_eq!(alignments[1], vec![0.0, 0.0, 0.0, 1.0]);
        let computed: f32 = alignments[2].iter().sum();
        assert!((computed - 1.0).abs() < 1e-5);
        Ok(())
    }
}
