//! Synthesize audio from precomputed features with a trained checkpoint.
//!
//! Each line of the file list names a `.safetensors` file holding a
//! `[n_mel_channels, frames]` feature tensor. Output goes to
//! `<output_dir>/<name>_synthesis.wav`.
//!
//! Usage:
//! ```sh
//! cargo run --release --features cli --bin infer -- \
//!     -f test_files.txt -w checkpoints/waveglow_final -o out -s 0.6
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::time::Instant;

use waveglow::{device_info, parse_device, GaussianNoise, Vocoder};

#[derive(Parser, Debug)]
#[command(author, version, about = "Generate audio with a WaveGlow checkpoint")]
struct Args {
    /// Text file with one feature file per line
    #[arg(short = 'f', long)]
    filelist: String,

    /// Checkpoint written by the trainer
    #[arg(short = 'w', long)]
    waveglow_path: String,

    /// Directory for the generated WAV files
    #[arg(short, long, default_value = ".")]
    output_dir: String,

    /// Standard deviation of the sampled latent
    #[arg(short, long, default_value_t = 1.0)]
    sigma: f64,

    /// Random seed for reproducible generation
    #[arg(long, default_value_t = 1234)]
    seed: u64,

    /// Sample rate written to the WAV header
    #[arg(long, default_value_t = 16000)]
    sampling_rate: u32,

    /// Tensor name of the features inside each file
    #[arg(long, default_value = "features")]
    feature_key: String,

    /// Device: auto, cpu, cuda, cuda:N, metal
    #[arg(long, default_value = "auto")]
    device: String,
}

fn read_file_list(path: &str) -> Result<Vec<PathBuf>> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("Failed to read file list {}", path))?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(PathBuf::from)
        .collect())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let device = parse_device(&args.device)?;
    tracing::info!("Device: {}", device_info(&device));

    let mut vocoder = Vocoder::from_checkpoint(&args.waveglow_path, args.sampling_rate, device.clone())?;
    let mut noise = GaussianNoise::new(args.seed);
    let output_dir = Path::new(&args.output_dir);
    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("Failed to create {}", output_dir.display()))?;

    for file in read_file_list(&args.filelist)? {
        let tensors = candle_core::safetensors::load(&file, &device)
            .with_context(|| format!("Failed to load {}", file.display()))?;
        let features = tensors
            .get(&args.feature_key)
            .with_context(|| format!("{} has no tensor named '{}'", file.display(), args.feature_key))?;

        let start = Instant::now();
        let audio = vocoder.synthesize(features, args.sigma, &mut noise)?;
        let elapsed = start.elapsed().as_secs_f64();

        let name = file
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("output");
        let out_path = output_dir.join(format!("{}_synthesis.wav", name));
        audio.save(&out_path)?;
        tracing::info!(
            "{}: {:.2}s of audio in {:.2}s (RTF {:.3})",
            out_path.display(),
            audio.duration(),
            elapsed,
            elapsed / audio.duration().max(f32::EPSILON) as f64
        );
    }
    Ok(())
}
