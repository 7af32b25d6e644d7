use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::info;

use melvae_burn::audio::{load_wav_at, AudioBuffer};
use melvae_burn::checkpoint::ParameterStore;
use melvae_burn::model::RunDir;
use melvae_burn::wrapper::waveform_samples;
use melvae_burn::{Device, Wrapper, WrapperOptions};

#[derive(Debug, Parser)]
#[command(name = "melvae")]
#[command(about = "Mel VAE codec with a MelGAN vocoder", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Compute and store the latent PCA basis from calibration audio.
    Pca {
        #[command(flatten)]
        run: RunArgs,
        /// WAV files used for calibration.
        #[arg(required = true)]
        audio: Vec<PathBuf>,
        /// Number of random calibration windows.
        #[arg(long, default_value_t = 32)]
        samples: usize,
        /// Seed for the window positions.
        #[arg(long, default_value_t = 0)]
        seed: u64,
        /// Recompute even if a basis already exists.
        #[arg(long, default_value_t = false)]
        force: bool,
    },
    /// Encode and decode a whole WAV file at once (batch mode).
    Reconstruct {
        #[command(flatten)]
        run: RunArgs,
        input: PathBuf,
        output: PathBuf,
        #[arg(long, default_value_t = false)]
        no_pca: bool,
    },
    /// Encode and decode a WAV file chunk by chunk (cached mode).
    Stream {
        #[command(flatten)]
        run: RunArgs,
        input: PathBuf,
        output: PathBuf,
    },
    /// List the tensors of a GGUF checkpoint.
    Inspect { checkpoint: PathBuf },
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Directory holding `runs/<name>`.
    #[arg(long, default_value = ".")]
    base: PathBuf,
    /// Run name.
    #[arg(long)]
    name: String,
}

impl RunArgs {
    fn run_dir(&self) -> RunDir {
        RunDir::named(&self.base, &self.name)
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt().with_target(false).init();

    let cli = Cli::parse();
    let device = Device::default();

    match cli.command {
        Command::Pca {
            run,
            audio,
            samples,
            seed,
            force,
        } => compute_pca(&run.run_dir(), &audio, samples, seed, force, &device),
        Command::Reconstruct {
            run,
            input,
            output,
            no_pca,
        } => reconstruct(&run.run_dir(), &input, &output, !no_pca, &device),
        Command::Stream { run, input, output } => stream(&run.run_dir(), &input, &output, &device),
        Command::Inspect { checkpoint } => inspect(&checkpoint),
    }
}

fn compute_pca(
    run: &RunDir,
    paths: &[PathBuf],
    samples: usize,
    seed: u64,
    force: bool,
    device: &Device,
) -> Result<()> {
    let pca_path = run.pca();
    if pca_path.exists() {
        if !force {
            info!("PCA basis already exists at {}", pca_path.display());
            return Ok(());
        }
        std::fs::remove_file(&pca_path)
            .with_context(|| format!("Failed to remove {}", pca_path.display()))?;
    }

    let sample_rate = melvae_burn::model::VaeConfig::load(&run.vae_config())?.sample_rate;
    let mut calibration = AudioBuffer::new(Vec::new(), sample_rate);
    for path in paths {
        calibration.append(&load_wav_at(path, sample_rate)?)?;
    }
    info!(
        files = paths.len(),
        seconds = calibration.duration_secs(),
        "Loaded calibration audio"
    );

    let options = WrapperOptions {
        use_cached_padding: Some(false),
        pca_samples: samples,
        calibration: Some(calibration),
        seed,
        ..Default::default()
    };
    Wrapper::load(run, options, device)?;
    Ok(())
}

fn reconstruct(
    run: &RunDir,
    input: &Path,
    output: &Path,
    pca: bool,
    device: &Device,
) -> Result<()> {
    let options = WrapperOptions {
        use_cached_padding: Some(false),
        pca,
        ..Default::default()
    };
    let mut codec = Wrapper::load(run, options, device)?;
    let audio = load_wav_at(input, codec.sample_rate())?;

    let start = Instant::now();
    let waveform = waveform_samples(codec.forward(&audio.samples)?)?;
    info!(
        elapsed_ms = start.elapsed().as_millis() as u64,
        seconds = audio.duration_secs(),
        "Reconstruction complete"
    );

    AudioBuffer::new(waveform, codec.sample_rate()).save(output)?;
    info!("Wrote {}", output.display());
    Ok(())
}

fn stream(run: &RunDir, input: &Path, output: &Path, device: &Device) -> Result<()> {
    let options = WrapperOptions {
        use_cached_padding: Some(true),
        ..Default::default()
    };
    let mut codec = Wrapper::load(run, options, device)?;
    let chunk_size = codec
        .chunk_size()
        .context("Streaming needs a cached-mode codec")?;
    let audio = load_wav_at(input, codec.sample_rate())?;

    let start = Instant::now();
    let chunks = audio.padded_chunks(chunk_size);
    let mut rendered = Vec::with_capacity(chunks.len() * chunk_size);
    for chunk in &chunks {
        rendered.extend(waveform_samples(codec.forward(chunk)?)?);
    }
    let elapsed = start.elapsed().as_secs_f32();
    info!(
        chunks = chunks.len(),
        realtime_factor = elapsed / audio.duration_secs().max(f32::EPSILON),
        "Streaming complete"
    );

    AudioBuffer::new(rendered, codec.sample_rate()).save(output)?;
    info!("Wrote {}", output.display());
    Ok(())
}

fn inspect(path: &Path) -> Result<()> {
    let store = ParameterStore::load(path)?;
    let mut total = 0usize;
    for (name, tensor) in store.iter() {
        total += tensor.data.len();
        println!("{name:<48} {:?}", tensor.shape);
    }
    println!("{} tensors, {total} parameters", store.len());
    Ok(())
}
