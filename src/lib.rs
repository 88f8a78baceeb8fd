//! Tacotron2 acoustic model built on candle. Give it a batch of symbol IDs and it predicts mel
//! and linear spectrograms plus the attention alignment between the two. With targets it also
//! gives you everything needed to train it, see [`training`].
use std::env;
use tracing::subscriber::SetGlobalDefaultError;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::{Layer, Registry};

pub mod alignment;
pub mod error;
pub mod hparams;
pub mod tacotron2;
pub mod training;

pub use error::{Error, Result};
pub use hparams::Hyperparameters;
pub use tacotron2::{Batch, ModelOutputs, StopReason, Tacotron2, Targets, UpdateOps};
pub use training::{LossModule, Losses, StepReport, Trainer};

pub fn setup_logging() -> std::result::Result<(), SetGlobalDefaultError> {
    let filter = match env::var("RUST_LOG") {
        Ok(_) => EnvFilter::from_env("RUST_LOG"),
        _ => EnvFilter::new("taco_tts=info,app=info,trainer=info"),
    };

    let fmt = tracing_subscriber::fmt::Layer::default();

    let subscriber = filter.and_then(fmt).with_subscriber(Registry::default());

    tracing::subscriber::set_global_default(subscriber)
}
