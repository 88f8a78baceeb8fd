//! Tacotron2 is a encoder-decoder sequence to sequence RNN model which predicts a sequence of mel
//! spectrogram frames from a sequence of tokens. These can be characters or phonemes, this module
//! doesn't care, it only sees IDs into a symbol table of `num_symbols` entries. Turning text into
//! those IDs is somebody else's problem.
//!
//! The variant implemented here is the one from the tacotron2 work-in-progress branch of Keith
//! Ito's tacotron. It differs from the paper in a couple of places:
//!
//! 1. There's no stop token, inference stops when the predicted frame goes quiet
//! 2. The mel output is expanded into a linear spectrogram by a second conv + LSTM stack so a
//!    Griffin-Lim vocoder can be run on the output directly
//! 3. Each decoder step emits `outputs_per_step` frames at once which cuts down on the number
//!    of recurrent steps (and training time) considerably
//!
//! If you want to learn more about tacotron2 here are some resources
//!
//! * [Papers with code](https://paperswithcode.com/method/tacotron-2)
//! * [Publication website](https://google.github.io/tacotron/publications/tacotron2/)
//! * [Location sensitive attention](https://arxiv.org/pdf/1506.07503.pdf)
//!
//! # What's is an Encoder-Decoder Model?
//!
//! An encoder-decoder model is a sequence-to-sequence model, this means it maps from one sequence
//! to another sequence of potentially varying length. With TTS the ordering of input and output
//! is the same, but how many audio frames each symbol takes isn't known ahead of time.
//!
//! The encoder turns the input into a vector per symbol. The decoder then generates the output
//! one step at a time, and on each step an attention mechanism picks which encoder vectors to
//! look at. The attention weights over the whole decode form the alignment between text and
//! audio, when training is going well they form a rough diagonal, which is something we can
//! nudge it towards with the guided attention loss (see [`crate::training`]).
//!
//! # Training vs Inference
//!
//! The graph is the same in both modes but a few things change depending on whether targets are
//! in the [`Batch`]:
//!
//! * The decoder is fed ground truth frames instead of its own predictions
//! * Prenet dropout is active
//! * Batch norm uses statistics of the current batch and schedules updates of its running
//!   statistics in [`UpdateOps`], these are applied by the trainer before the optimiser step
use crate::error::{Error, Result};
use crate::hparams::Hyperparameters;
use candle_core::{Module, Tensor};
use candle_nn::{Embedding, VarBuilder};
use tracing::{debug, info};

pub mod attention;
pub mod decoder;
pub mod embedding;
pub mod encoder;
pub mod layers;
pub mod postnet;
pub mod rnn;

pub use decoder::StopReason;
pub use layers::UpdateOps;

use decoder::{Decoder, DecoderConfig, Helper};
use encoder::{ConvLstmConfig, Encoder, Expander};
use layers::{sequence_mask, NormConfig};
use postnet::{Postnet, PostnetConfig};

/// Ground truth spectrograms for a batch.
#[derive(Clone, Debug)]
pub struct Targets {
    /// `[N, T_out, num_mels]`
    pub mel: Tensor,
    /// `[N, T_out, num_freq]`
    pub linear: Tensor,
}

/// A batch of right padded ID sequences and everything that goes along with them.
#[derive(Clone, Debug)]
pub struct Batch {
    /// `[N, T_in]` integer symbol IDs
    pub inputs: Tensor,
    /// Unpadded length of each sequence, the longest must equal `T_in`
    pub input_lengths: Vec<usize>,
    /// Present when training
    pub targets: Option<Targets>,
    /// `[N, S, T_in]` alignments forced onto the first `S` decoder steps. This is a diagnostic
    /// tool for inference, you don't want it while training.
    pub manual_alignments: Option<Tensor>,
}

impl Batch {
    pub fn inference(inputs: Tensor, input_lengths: Vec<usize>) -> Self {
        Self {
            inputs,
            input_lengths,
            targets: None,
            manual_alignments: None,
        }
    }

    pub fn training(
        inputs: Tensor,
        input_lengths: Vec<usize>,
        mel_targets: Tensor,
        linear_targets: Tensor,
    ) -> Self {
        Self {
            inputs,
            input_lengths,
            targets: Some(Targets {
                mel: mel_targets,
                linear: linear_targets,
            }),
            manual_alignments: None,
        }
    }

    pub fn with_manual_alignments(mut self, alignments: Tensor) -> Self {
        self.manual_alignments = Some(alignments);
        self
    }

    pub fn is_training(&self) -> bool {
        self.targets.is_some()
    }
}

/// Everything produced by one forward pass.
#[derive(Clone, Debug)]
pub struct ModelOutputs {
    /// `[N, T_out, num_mels]` straight from the decoder
    pub decoder_outputs: Tensor,
    /// `[N, T_out, num_mels]` decoder output plus the postnet residual
    pub mel_outputs: Tensor,
    /// `[N, T_out, num_freq]`
    pub linear_outputs: Tensor,
    /// `[N, T_in, decoder_steps]` attention weights for every decoder step
    pub alignments: Tensor,
    pub decoder_steps: usize,
    pub stop_reason: StopReason,
    pub input_lengths: Vec<usize>,
    /// Carried over from the batch so the loss can be computed from the outputs alone
    pub targets: Option<Targets>,
}

#[derive(Debug)]
pub struct Tacotron2 {
    hparams: Hyperparameters,
    embedding: Embedding,
    encoder: Encoder,
    decoder: Decoder,
    postnet: Postnet,
    expander: Expander,
    updates: UpdateOps,
}

impl Tacotron2 {
    /// Creates every parameter of the network through `vb`. With a `VarMap` backed builder the
    /// parameters are freshly initialised and trainable, otherwise they're read from whatever
    /// the builder wraps.
    pub fn new(hparams: &Hyperparameters, vb: VarBuilder) -> Result<Self> {
        hparams.validate()?;
        let hp = hparams;
        let vb = vb.pp("inference");
        let updates = UpdateOps::new();
        let norm = NormConfig {
            momentum: hp.batch_norm_momentum,
            epsilon: hp.batch_norm_epsilon,
        };

        let embedding = embedding::embedding_table(
            hp.num_symbols,
            hp.embedding_dim,
            hp.embedding_stddev,
            vb.pp("embedding"),
        )?;
        let encoder = Encoder::new(
            hp.embedding_dim,
            ConvLstmConfig {
                conv_layers: hp.encoder_conv_layers,
                conv_width: hp.encoder_conv_width,
                conv_channels: hp.encoder_conv_channels,
                lstm_units: hp.encoder_lstm_units,
            },
            norm,
            &updates,
            vb.pp("encoder"),
        )?;
        let decoder = Decoder::new(
            &DecoderConfig {
                num_mels: hp.num_mels,
                outputs_per_step: hp.outputs_per_step,
                encoder_dim: hp.encoder_output_dim(),
                prenet_depths: hp.prenet_depths.clone(),
                prenet_dropout: hp.prenet_dropout,
                attention_rnn_units: hp.attention_depth,
                attention_depth: hp.attention_depth,
                location_filters: hp.location_filters,
                location_kernel_size: hp.location_kernel_size,
                decoder_rnn_units: hp.decoder_lstm_units,
            },
            vb.pp("decoder"),
        )?;
        let postnet = Postnet::new(
            hp.num_mels,
            PostnetConfig {
                layers: hp.postnet_conv_layers,
                conv_width: hp.postnet_conv_width,
                channels: hp.postnet_conv_channels,
            },
            norm,
            &updates,
            vb.pp("postnet"),
        )?;
        let expander = Expander::new(
            hp.num_mels,
            hp.num_freq,
            ConvLstmConfig {
                conv_layers: hp.expand_conv_layers,
                conv_width: hp.expand_conv_width,
                conv_channels: hp.expand_conv_channels,
                lstm_units: hp.expand_lstm_units,
            },
            norm,
            &updates,
            vb.pp("expander"),
        )?;

        info!("Initialized Tacotron model. Dimensions:");
        info!("  embedding:               {}", hp.embedding_dim);
        info!("  encoder out:             {}", hp.encoder_output_dim());
        info!("  attention out:           {}", hp.attention_depth);
        info!(
            "  concat attn & out:       {}",
            hp.attention_depth + hp.encoder_output_dim()
        );
        info!("  decoder cell out:        {}", hp.decoder_lstm_units);
        info!(
            "  decoder out ({} frames):  {}",
            hp.outputs_per_step,
            hp.num_mels * hp.outputs_per_step
        );
        info!("  decoder out (1 frame):   {}", hp.num_mels);
        info!("  expand out:              {}", 2 * hp.expand_lstm_units);
        info!("  linear out:              {}", hp.num_freq);

        Ok(Self {
            hparams: hparams.clone(),
            embedding,
            encoder,
            decoder,
            postnet,
            expander,
            updates,
        })
    }

    pub fn hparams(&self) -> &Hyperparameters {
        &self.hparams
    }

    /// Running statistic updates scheduled by training forward passes.
    pub fn update_ops(&self) -> &UpdateOps {
        &self.updates
    }

    pub fn postnet(&self) -> &Postnet {
        &self.postnet
    }

    /// Makes sure the batch is consistent with itself and the hyperparameters before anything
    /// runs, returns the padded input length.
    fn check_batch(&self, batch: &Batch) -> Result<usize> {
        let hp = &self.hparams;
        let (batch_size, input_len) = batch.inputs.dims2().map_err(|_| {
            Error::Shape(format!(
                "inputs must be [N, T_in], got {:?}",
                batch.inputs.dims()
            ))
        })?;
        if batch.input_lengths.len() != batch_size {
            return Err(Error::Shape(format!(
                "{} input lengths for a batch of {}",
                batch.input_lengths.len(),
                batch_size
            )));
        }
        if batch.input_lengths.iter().copied().max() != Some(input_len) {
            return Err(Error::Shape(format!(
                "inputs are padded to {} but the longest length is {:?}",
                input_len,
                batch.input_lengths.iter().max()
            )));
        }
        if batch.input_lengths.contains(&0) {
            return Err(Error::Shape("empty input sequence in batch".to_string()));
        }

        if let Some(targets) = &batch.targets {
            let mel_shape_error = || {
                Error::Shape(format!(
                    "mel targets must be [{}, T_out, {}], got {:?}",
                    batch_size,
                    hp.num_mels,
                    targets.mel.dims()
                ))
            };
            let (n, frames, mels) = targets.mel.dims3().map_err(|_| mel_shape_error())?;
            if n != batch_size || mels != hp.num_mels {
                return Err(mel_shape_error());
            }
            if frames == 0 || frames % hp.outputs_per_step != 0 {
                return Err(Error::Shape(format!(
                    "target length {} isn't a positive multiple of outputs_per_step {}",
                    frames, hp.outputs_per_step
                )));
            }
            if targets.linear.dims() != [batch_size, frames, hp.num_freq] {
                return Err(Error::Shape(format!(
                    "linear targets must be [{}, {}, {}], got {:?}",
                    batch_size,
                    frames,
                    hp.num_freq,
                    targets.linear.dims()
                )));
            }
        }

        if let Some(manual) = &batch.manual_alignments {
            if batch.is_training() {
                return Err(Error::Shape(
                    "manual alignments can't be used with training targets".to_string(),
                ));
            }
            let dims = manual.dims();
            if dims.len() != 3 || dims[0] != batch_size || dims[2] != input_len {
                return Err(Error::Shape(format!(
                    "manual alignments must be [{}, S, {}], got {:?}",
                    batch_size, input_len, dims
                )));
            }
        }
        Ok(input_len)
    }

    /// Runs the whole network. Targets in the batch switch on training behaviour.
    pub fn forward(&self, batch: &Batch) -> Result<ModelOutputs> {
        let input_len = self.check_batch(batch)?;
        let hp = &self.hparams;
        let train = batch.is_training();
        let device = batch.inputs.device();

        let mask = sequence_mask(&batch.input_lengths, input_len, device)?;
        let embedded = self.embedding.forward(&batch.inputs)?;
        let encoder_outputs = self.encoder.forward(&embedded, &mask, train)?;

        let helper = match &batch.targets {
            Some(targets) => Helper::TeacherForcing {
                targets: &targets.mel,
                outputs_per_step: hp.outputs_per_step,
                num_mels: hp.num_mels,
            },
            None => Helper::SelfFeed {
                max_iters: hp.max_iters,
                stop_threshold: hp.stop_threshold,
                outputs_per_step: hp.outputs_per_step,
                num_mels: hp.num_mels,
            },
        };
        let decoded = self.decoder.decode(
            &encoder_outputs,
            &mask,
            &helper,
            batch.manual_alignments.as_ref(),
            train,
        )?;

        let decoder_outputs = decoded.frames;
        let residual = self.postnet.forward(&decoder_outputs, train)?;
        let mel_outputs = (&decoder_outputs + &residual)?;
        let linear_outputs = self.expander.forward(&mel_outputs, train)?;
        debug!(
            "Forward pass: {} decoder steps, mel {:?}, linear {:?}",
            decoded.steps,
            mel_outputs.dims(),
            linear_outputs.dims()
        );

        Ok(ModelOutputs {
            decoder_outputs,
            mel_outputs,
            linear_outputs,
            alignments: decoded.alignments,
            decoder_steps: decoded.steps,
            stop_reason: decoded.stop_reason,
            input_lengths: batch.input_lengths.clone(),
            targets: batch.targets.clone(),
        })
    }
}
