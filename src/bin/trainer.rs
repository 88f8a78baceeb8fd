use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use clap::Parser;
use ndarray::{Array1, Array2, Array3};
use ndarray_npy::read_npy;
use std::path::{Path, PathBuf};
use taco_tts::alignment::{batch_alignment, export_alignment};
use taco_tts::*;
use tracing::info;

/// Runs the optimiser on a single batch stored as npy files. Useful for checking the model can
/// overfit something before throwing a whole dataset at it.
#[derive(Parser, Debug)]
pub struct Args {
    /// `[N, T_in]` integer symbol IDs, right padded
    #[clap(long)]
    inputs: PathBuf,
    /// `[N]` unpadded lengths of each input
    #[clap(long)]
    input_lengths: PathBuf,
    /// `[N, T_out, num_mels]` target mel spectrograms
    #[clap(long)]
    mel_targets: PathBuf,
    /// `[N, T_out, num_freq]` target linear spectrograms
    #[clap(long)]
    linear_targets: PathBuf,
    #[clap(long)]
    hparams: Option<PathBuf>,
    /// Checkpoint to resume from
    #[clap(long)]
    weights: Option<PathBuf>,
    #[clap(long, default_value = "100")]
    steps: usize,
    /// Global step to start counting from, affects the learning rate
    #[clap(long, default_value = "0")]
    start_step: usize,
    /// Log a step report every this many steps
    #[clap(long, default_value = "10")]
    log_every: usize,
    /// Where to save the trained weights
    #[clap(short, long, default_value = "tacotron2.safetensors")]
    output: PathBuf,
    /// Export the alignment of the first batch entry after the last step
    #[clap(long)]
    alignment: Option<PathBuf>,
}

fn load_ids(path: &Path, device: &Device) -> anyhow::Result<Tensor> {
    let ids: Array2<i64> = read_npy(path)?;
    let dim = ids.dim();
    let ids = ids
        .iter()
        .map(|&id| u32::try_from(id))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(Tensor::from_vec(ids, dim, device)?)
}

fn load_lengths(path: &Path) -> anyhow::Result<Vec<usize>> {
    let lengths: Array1<i64> = read_npy(path)?;
    Ok(lengths
        .iter()
        .map(|&len| usize::try_from(len))
        .collect::<std::result::Result<Vec<_>, _>>()?)
}

fn load_spectrogram(path: &Path, device: &Device) -> anyhow::Result<Tensor> {
    let spec: Array3<f32> = read_npy(path)?;
    let dim = spec.dim();
    let spec = spec.as_standard_layout().to_owned();
    Ok(Tensor::from_vec(spec.into_raw_vec(), dim, device)?)
}

fn main() -> anyhow::Result<()> {
    taco_tts::setup_logging()?;
    let args = Args::parse();
    let device = Device::Cpu;

    let hparams = match &args.hparams {
        Some(path) => Hyperparameters::from_file(path)?,
        None => Hyperparameters::default(),
    };
    let batch = Batch::training(
        load_ids(&args.inputs, &device)?,
        load_lengths(&args.input_lengths)?,
        load_spectrogram(&args.mel_targets, &device)?,
        load_spectrogram(&args.linear_targets, &device)?,
    );

    let mut varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let model = Tacotron2::new(&hparams, vb)?;
    if let Some(weights) = &args.weights {
        info!("Resuming from {}", weights.display());
        varmap.load(weights)?;
    }
    let loss_module = LossModule::new(&hparams, &device)?;
    let mut trainer = Trainer::new(&varmap, &model)?;

    let mut last_outputs = None;
    for global_step in args.start_step..args.start_step + args.steps {
        let outputs = model.forward(&batch)?;
        let losses = loss_module.compute(&outputs)?;
        let report = trainer.step(&losses, global_step)?;
        if report.global_step % args.log_every.max(1) == 0 {
            info!("{}", serde_json::to_string(&report)?);
        }
        last_outputs = Some(outputs);
    }

    varmap.save(&args.output)?;
    info!("Weights saved to {}", args.output.display());

    if let (Some(path), Some(outputs)) = (&args.alignment, &last_outputs) {
        let alignment = batch_alignment(&outputs.alignments, 0)?;
        let info = format!("step {}", args.start_step + args.steps);
        export_alignment(&alignment, path, Some(&info), None)?;
    }
    Ok(())
}
