//! Train a WaveGlow model from a JSON configuration.
//!
//! Usage:
//! ```sh
//! cargo run --release --features cli --bin train -- -c config.json --device auto
//! ```

use anyhow::Result;
use clap::Parser;

use waveglow::data::AudioFeatureDataset;
use waveglow::training::Trainer;
use waveglow::{device_info, parse_device, Config};

#[derive(Parser, Debug)]
#[command(author, version, about = "Train a WaveGlow vocoder")]
struct Args {
    /// JSON file for configuration
    #[arg(short, long)]
    config: String,

    /// Device: auto, cpu, cuda, cuda:N, metal
    #[arg(long, default_value = "auto")]
    device: String,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let config = Config::from_file(&args.config)?;
    let device = parse_device(&args.device)?;
    tracing::info!("Device: {}", device_info(&device));

    let n_mel = config.waveglow_config.n_mel_channels;
    let seed = config.train_config.seed;
    let mut trainset = AudioFeatureDataset::from_file_list(
        &config.data_config.training_files,
        &config.data_config,
        n_mel,
        seed,
    )?;
    let mut valset = match &config.data_config.validation_files {
        Some(list) => Some(AudioFeatureDataset::from_file_list(
            list,
            &config.data_config,
            n_mel,
            seed,
        )?),
        None => None,
    };

    let mut trainer = Trainer::new(config, device)?;
    trainer.fit(&mut trainset, valset.as_mut())
}
