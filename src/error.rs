//! Error types for the acoustic model.

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Tensor or parameter error from candle.
    #[error("candle: {0}")]
    Candle(#[from] candle_core::Error),

    /// Hyperparameters that can't describe a graph.
    #[error("config: {0}")]
    Config(String),

    /// Batch tensors inconsistent with each other or with the hyperparameters.
    #[error("shape: {0}")]
    Shape(String),

    /// The loss needs the targets from a training forward pass.
    #[error("loss requires a training forward pass with mel and linear targets")]
    MissingTargets,

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("npy write: {0}")]
    WriteNpy(#[from] ndarray_npy::WriteNpyError),

    #[error("npy read: {0}")]
    ReadNpy(#[from] ndarray_npy::ReadNpyError),

    #[error("array shape: {0}")]
    NdShape(#[from] ndarray::ShapeError),
}
