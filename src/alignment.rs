//! Saving attention alignments so they can be inspected outside of the model. The matrix goes
//! into a `.npy` file and a JSON file next to it describes what it is, plotting is left to
//! whatever tool you like to plot numpy arrays with.
use crate::error::Result;
use candle_core::{IndexOp, Tensor};
use ndarray::{s, Array2};
use ndarray_npy::write_npy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/// Description written next to an exported alignment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AlignmentInfo {
    /// Rows in the exported matrix
    pub encoder_steps: usize,
    /// Columns in the exported matrix
    pub decoder_steps: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

/// Pulls the `[T_in, steps]` alignment of one batch entry out of the `[N, T_in, steps]` model
/// output.
pub fn batch_alignment(alignments: &Tensor, index: usize) -> Result<Array2<f32>> {
    let alignment = alignments.i(index)?;
    let (rows, cols) = alignment.dims2()?;
    let data = alignment.flatten_all()?.to_vec1::<f32>()?;
    Ok(Array2::from_shape_vec((rows, cols), data)?)
}

/// Path of the JSON description for an alignment saved at `path`.
pub fn sidecar_path(path: &Path) -> PathBuf {
    path.with_extension("json")
}

/// Writes `alignment` to `path` as a `.npy` file plus a JSON sidecar.
///
/// When `text` is given the encoder axis is cut down to one row per character plus two, the
/// rest is padding nobody wants to look at.
pub fn export_alignment(
    alignment: &Array2<f32>,
    path: impl AsRef<Path>,
    info: Option<&str>,
    text: Option<&str>,
) -> Result<AlignmentInfo> {
    let path = path.as_ref();
    let rows = match text {
        Some(text) if !text.is_empty() => (text.chars().count() + 2).min(alignment.nrows()),
        _ => alignment.nrows(),
    };
    let trimmed = alignment.slice(s![..rows, ..]);
    write_npy(path, &trimmed)?;

    let description = AlignmentInfo {
        encoder_steps: rows,
        decoder_steps: alignment.ncols(),
        info: info.map(str::to_string),
        text: text.map(str::to_string),
    };
    fs::write(
        sidecar_path(path),
        serde_json::to_string_pretty(&description)?,
    )?;
    info!("Alignment saved: {}", path.display());
    Ok(description)
}
