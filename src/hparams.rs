//! Hyperparameters for the acoustic model.
//!
//! Everything the graph needs to know about layer sizes, the decode loop and the optimiser is
//! read from here once when the model is built. Any subset can be overridden from a JSON file,
//! missing fields take the defaults below which match the published tacotron2 work-in-progress
//! setup (22kHz-ish audio, 80 mels, 5 frames per decoder step).
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Hyperparameters {
    /// Size of the symbol table the input IDs index into.
    pub num_symbols: usize,
    pub embedding_dim: usize,
    /// Standard deviation of the truncated normal used to initialise the embedding table.
    pub embedding_stddev: f64,

    pub encoder_conv_layers: usize,
    pub encoder_conv_width: usize,
    pub encoder_conv_channels: usize,
    /// Units per direction, the encoder output is twice this wide.
    pub encoder_lstm_units: usize,

    pub attention_depth: usize,
    pub location_filters: usize,
    pub location_kernel_size: usize,

    pub prenet_depths: Vec<usize>,
    pub prenet_dropout: f32,
    pub decoder_lstm_units: usize,
    /// Number of mel frames emitted by a single decoder step (`r`).
    pub outputs_per_step: usize,
    /// Hard cap on decoder steps when decoding without targets.
    pub max_iters: usize,
    /// A self-fed frame whose values are all below this magnitude is treated as silence and
    /// stops decoding.
    pub stop_threshold: f32,

    pub postnet_conv_layers: usize,
    pub postnet_conv_width: usize,
    pub postnet_conv_channels: usize,

    pub expand_conv_layers: usize,
    pub expand_conv_width: usize,
    pub expand_conv_channels: usize,
    pub expand_lstm_units: usize,

    pub batch_norm_momentum: f64,
    pub batch_norm_epsilon: f64,

    pub num_mels: usize,
    pub num_freq: usize,
    pub sample_rate: usize,

    pub adam_beta1: f64,
    pub adam_beta2: f64,
    pub adam_epsilon: f64,
    pub initial_learning_rate: f64,
    pub learning_rate_decay_halflife: usize,
    pub grad_clip_norm: f64,

    /// Encoder axis of the guided attention window.
    pub max_n: usize,
    /// Decoder axis of the guided attention window.
    pub max_t: usize,
    pub guided_attention_g: f64,
    /// Weight of the guided attention term in the total loss, zero leaves it out.
    pub guided_attention_weight: f64,
}

impl Default for Hyperparameters {
    fn default() -> Self {
        Self {
            num_symbols: 80,
            embedding_dim: 512,
            embedding_stddev: 0.5,
            encoder_conv_layers: 3,
            encoder_conv_width: 5,
            encoder_conv_channels: 512,
            encoder_lstm_units: 256,
            attention_depth: 128,
            location_filters: 32,
            location_kernel_size: 31,
            prenet_depths: vec![256, 128],
            prenet_dropout: 0.5,
            decoder_lstm_units: 1024,
            outputs_per_step: 5,
            max_iters: 200,
            stop_threshold: 0.1,
            postnet_conv_layers: 5,
            postnet_conv_width: 5,
            postnet_conv_channels: 512,
            expand_conv_layers: 5,
            expand_conv_width: 5,
            expand_conv_channels: 512,
            expand_lstm_units: 256,
            batch_norm_momentum: 0.99,
            batch_norm_epsilon: 1e-3,
            num_mels: 80,
            num_freq: 1025,
            sample_rate: 20000,
            adam_beta1: 0.9,
            adam_beta2: 0.999,
            adam_epsilon: 1e-8,
            initial_learning_rate: 0.0015,
            learning_rate_decay_halflife: 100000,
            grad_clip_norm: 1.0,
            max_n: 90,
            max_t: 200,
            guided_attention_g: 0.2,
            guided_attention_weight: 0.0,
        }
    }
}

impl Hyperparameters {
    /// Loads hyperparameters from a JSON file and validates them.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let hparams: Self = serde_json::from_str(&contents)?;
        hparams.validate()?;
        Ok(hparams)
    }

    /// Number of linear-spectrogram bins below 2kHz, these get double weight in the linear loss.
    pub fn n_priority_freq(&self) -> usize {
        // floor(2000 / (sample_rate / 2) * num_freq) without going through floats
        (4000 * self.num_freq / self.sample_rate).min(self.num_freq)
    }

    /// Width of the encoder output sequence (both LSTM directions).
    pub fn encoder_output_dim(&self) -> usize {
        2 * self.encoder_lstm_units
    }

    /// Checks the configuration can actually describe a graph.
    pub fn validate(&self) -> Result<()> {
        let nonzero = [
            ("num_symbols", self.num_symbols),
            ("embedding_dim", self.embedding_dim),
            ("encoder_conv_channels", self.encoder_conv_channels),
            ("encoder_lstm_units", self.encoder_lstm_units),
            ("attention_depth", self.attention_depth),
            ("location_filters", self.location_filters),
            ("decoder_lstm_units", self.decoder_lstm_units),
            ("outputs_per_step", self.outputs_per_step),
            ("max_iters", self.max_iters),
            ("postnet_conv_layers", self.postnet_conv_layers),
            ("postnet_conv_channels", self.postnet_conv_channels),
            ("expand_conv_channels", self.expand_conv_channels),
            ("expand_lstm_units", self.expand_lstm_units),
            ("num_mels", self.num_mels),
            ("num_freq", self.num_freq),
            ("sample_rate", self.sample_rate),
            ("learning_rate_decay_halflife", self.learning_rate_decay_halflife),
            ("max_n", self.max_n),
            ("max_t", self.max_t),
        ];
        if let Some((name, _)) = nonzero.iter().find(|(_, v)| *v == 0) {
            return Err(Error::Config(format!("{} must be greater than zero", name)));
        }

        // Even widths can't be padded symmetrically so the time axis would shift.
        let widths = [
            ("encoder_conv_width", self.encoder_conv_width),
            ("location_kernel_size", self.location_kernel_size),
            ("postnet_conv_width", self.postnet_conv_width),
            ("expand_conv_width", self.expand_conv_width),
        ];
        if let Some((name, width)) = widths.iter().find(|(_, w)| w % 2 == 0) {
            return Err(Error::Config(format!(
                "{} must be odd to preserve sequence length, got {}",
                name, width
            )));
        }

        if self.prenet_depths.is_empty() || self.prenet_depths.contains(&0) {
            return Err(Error::Config(format!(
                "prenet_depths must be non-empty and positive, got {:?}",
                self.prenet_depths
            )));
        }
        if !(0.0..1.0).contains(&self.prenet_dropout) {
            return Err(Error::Config(format!(
                "prenet_dropout must be in [0, 1), got {}",
                self.prenet_dropout
            )));
        }
        if !(0.0..1.0).contains(&self.batch_norm_momentum) {
            return Err(Error::Config(format!(
                "batch_norm_momentum must be in [0, 1), got {}",
                self.batch_norm_momentum
            )));
        }
        if self.embedding_stddev <= 0.0 || self.guided_attention_g <= 0.0 {
            return Err(Error::Config(
                "embedding_stddev and guided_attention_g must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// A very small network so tests run in milliseconds on the CPU.
    #[cfg(test)]
    pub(crate) fn tiny() -> Self {
        Self {
            num_symbols: 12,
            embedding_dim: 8,
            encoder_conv_layers: 2,
            encoder_conv_width: 3,
            encoder_conv_channels: 8,
            encoder_lstm_units: 4,
            attention_depth: 8,
            location_filters: 4,
            location_kernel_size: 3,
            prenet_depths: vec![8, 6],
            decoder_lstm_units: 8,
            outputs_per_step: 5,
            max_iters: 10,
            postnet_conv_layers: 2,
            postnet_conv_width: 3,
            postnet_conv_channels: 8,
            expand_conv_layers: 1,
            expand_conv_width: 3,
            expand_conv_channels: 8,
            expand_lstm_units: 4,
            num_mels: 4,
            num_freq: 10,
            max_n: 8,
            max_t: 6,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        Hyperparameters::default().validate().unwrap();
        Hyperparameters::tiny().validate().unwrap();
    }

    #[test]
    fn priority_frequency_bins() {
        let hparams = Hyperparameters {
            sample_rate: 20000,
            num_freq: 512,
            ..Default::default()
        };
        assert_eq!(hparams.n_priority_freq(), 102);

        let hparams = Hyperparameters::default();
        // 2000 / 10000 * 1025 = 205
        assert_eq!(hparams.n_priority_freq(), 205);
    }

    #[test]
    fn partial_json_uses_defaults() {
        let hparams: Hyperparameters =
            serde_json::from_str(r#"{"num_mels": 40, "outputs_per_step": 2}"#).unwrap();
        assert_eq!(hparams.num_mels, 40);
        assert_eq!(hparams.outputs_per_step, 2);
        assert_eq!(hparams.num_freq, Hyperparameters::default().num_freq);
    }

    #[test]
    fn rejects_bad_configs() {
        let even = Hyperparameters {
            postnet_conv_width: 4,
            ..Default::default()
        };
        assert!(matches!(even.validate(), Err(Error::Config(_))));

        let no_frames = Hyperparameters {
            outputs_per_step: 0,
            ..Default::default()
        };
        assert!(matches!(no_frames.validate(), Err(Error::Config(_))));

        let no_prenet = Hyperparameters {
            prenet_depths: vec![],
            ..Default::default()
        };
        assert!(matches!(no_prenet.validate(), Err(Error::Config(_))));
    }
}
