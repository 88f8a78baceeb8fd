//! Symbol embedding table.
use candle_core::{DType, Result, Tensor, Var};
use candle_nn::{Embedding, Init, VarBuilder};

/// Values further than this many standard deviations from the mean get redrawn.
const TRUNCATION_STDDEVS: f64 = 2.0;
/// Redraws before falling back to clamping whatever is still out of range.
const TRUNCATION_ROUNDS: usize = 8;

/// Replaces every value outside `±2σ` with a fresh draw, like a truncated normal initialiser.
fn truncate_normal(sample: &Tensor, stddev: f64) -> Result<Tensor> {
    let bound = (TRUNCATION_STDDEVS * stddev) as f32;
    let mut values = sample.clone();
    for _ in 0..TRUNCATION_ROUNDS {
        let outside = values.abs()?.gt(bound)?;
        let remaining = outside.to_dtype(DType::F32)?.sum_all()?.to_scalar::<f32>()?;
        if remaining == 0.0 {
            break;
        }
        let fresh = Tensor::randn(0f32, stddev as f32, values.dims(), values.device())?;
        values = outside.where_cond(&fresh, &values)?;
    }
    // Fallback for whatever survived every redraw, puts a sliver of mass on the bound itself.
    values.clamp(-bound, bound)
}

/// Creates the embedding table for `num_symbols` IDs initialised from a truncated normal.
///
/// When the builder is backed by a `VarMap` the table is a trainable variable which we
/// overwrite in place, when it's backed by loaded weights those are used untouched.
pub fn embedding_table(
    num_symbols: usize,
    dim: usize,
    stddev: f64,
    vb: VarBuilder,
) -> Result<Embedding> {
    let weight = vb.get_with_hints(
        (num_symbols, dim),
        "weight",
        Init::Randn {
            mean: 0.0,
            stdev: stddev,
        },
    )?;
    if weight.is_variable() {
        Var::from_tensor(&weight)?.set(&truncate_normal(&weight, stddev)?)?;
    }
    Ok(Embedding::new(weight, dim))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::{Module, VarMap};

    #[test]
    fn table_is_truncated() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let table = embedding_table(200, 16, 0.5, vb)?;

        let max = table
            .embeddings()
            .abs()?
            .flatten_all()?
            .max(0)?
            .to_scalar::<f32>()?;
        assert!(max <= 1.0);
        assert_eq!(varmap.all_vars().len(), 1);
        Ok(())
    }

    #[test]
    fn lookup_is_a_gather() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let table = embedding_table(5, 3, 0.5, vb)?;

        let ids = Tensor::new(&[[4u32, 0, 4]], &device)?;
        let embedded = table.forward(&ids)?;
        assert_eq!(embedded.dims(), &[1, 3, 3]);

        let rows = embedded.squeeze(0)?.to_vec2::<f32>()?;
        let weights = table.embeddings().to_vec2::<f32>()?;
        assert_eq!(rows[0], weights[4]);
        assert_eq!(rows[1], weights[0]);
        assert_eq!(rows[0], rows[2]);
        Ok(())
    }
}
