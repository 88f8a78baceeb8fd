use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use clap::Parser;
use ndarray::Array2;
use ndarray_npy::{read_npy, write_npy};
use std::path::{Path, PathBuf};
use std::time::Instant;
use taco_tts::alignment::{batch_alignment, export_alignment};
use taco_tts::*;
use tracing::{info, warn};

#[derive(Parser, Debug)]
pub struct Args {
    /// Comma separated symbol IDs to synthesise, e.g. `12,5,33,1`
    #[clap(long, short)]
    input: String,
    /// Text the IDs were made from, only used to label and trim the alignment
    #[clap(long)]
    text: Option<String>,
    /// JSON hyperparameters, defaults are used when not given
    #[clap(long)]
    hparams: Option<PathBuf>,
    /// Safetensors checkpoint written by the trainer
    #[clap(long)]
    weights: Option<PathBuf>,
    /// `[S, T_in]` npy array of alignments to force onto the first S decoder steps
    #[clap(long)]
    manual_alignment: Option<PathBuf>,
    /// Directory to write the spectrograms and alignment to
    #[clap(short, long, default_value = "output")]
    output: PathBuf,
}

fn parse_ids(input: &str) -> anyhow::Result<Vec<u32>> {
    let ids = input
        .split(',')
        .map(|id| id.trim().parse::<u32>())
        .collect::<std::result::Result<Vec<_>, _>>()?;
    anyhow::ensure!(!ids.is_empty(), "no symbol IDs in input");
    Ok(ids)
}

/// Drops the batch dimension of a `[1, T, C]` tensor.
fn to_array(tensor: &Tensor) -> anyhow::Result<Array2<f32>> {
    let (_, frames, channels) = tensor.dims3()?;
    let data = tensor.flatten_all()?.to_vec1::<f32>()?;
    Ok(Array2::from_shape_vec((frames, channels), data)?)
}

fn load_manual_alignment(path: &Path, device: &Device) -> anyhow::Result<Tensor> {
    let manual: Array2<f32> = read_npy(path)?;
    let (steps, input_len) = manual.dim();
    let manual = manual.as_standard_layout().to_owned();
    Ok(Tensor::from_vec(
        manual.into_raw_vec(),
        (1, steps, input_len),
        device,
    )?)
}

fn main() -> anyhow::Result<()> {
    taco_tts::setup_logging()?;
    let args = Args::parse();
    let device = Device::Cpu;

    info!("Loading resources");
    let hparams = match &args.hparams {
        Some(path) => Hyperparameters::from_file(path)?,
        None => Hyperparameters::default(),
    };
    let mut varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let model = Tacotron2::new(&hparams, vb)?;
    match &args.weights {
        Some(weights) => varmap.load(weights)?,
        None => warn!("No weights given, running with a randomly initialised model"),
    }

    let ids = parse_ids(&args.input)?;
    let input_lengths = vec![ids.len()];
    let inputs = Tensor::from_vec(ids, (1, input_lengths[0]), &device)?;
    let mut batch = Batch::inference(inputs, input_lengths);
    if let Some(path) = &args.manual_alignment {
        batch = batch.with_manual_alignments(load_manual_alignment(path, &device)?);
    }

    let start = Instant::now();
    let outputs = model.forward(&batch)?;
    info!(
        "Inference took {:?}: {} decoder steps, stopped on {:?}",
        start.elapsed(),
        outputs.decoder_steps,
        outputs.stop_reason
    );

    std::fs::create_dir_all(&args.output)?;
    write_npy(args.output.join("mel.npy"), &to_array(&outputs.mel_outputs)?)?;
    write_npy(
        args.output.join("linear.npy"),
        &to_array(&outputs.linear_outputs)?,
    )?;
    let alignment = batch_alignment(&outputs.alignments, 0)?;
    export_alignment(
        &alignment,
        args.output.join("alignment.npy"),
        Some(&format!("{} decoder steps", outputs.decoder_steps)),
        args.text.as_deref(),
    )?;
    info!("Spectrograms saved to {}", args.output.display());
    Ok(())
}
