use anyhow::{Context, Result};
use clap::Parser;
use vision::{VisionCliArgs, VisionConfig};

/// Serve live vehicle detections from one camera over HTTP.
#[derive(Debug, Parser)]
#[command(name = "caralert", version, about)]
pub struct Cli {
    #[command(flatten)]
    pub vision: VisionCliArgs,
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = VisionConfig::try_from(cli.vision).context("Invalid configuration")?;
    vision::run(config)
}
