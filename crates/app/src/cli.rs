use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::tracking::{self, TrackingCliArgs, TrackingConfig};

#[derive(Debug, Parser)]
#[command(
    name = "hand-input",
    about = "Depth-camera hand tracking pipeline with stability gating"
)]
pub(crate) struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the tracking pipeline against a synthetic sensor source.
    Track(TrackingCliArgs),
}

pub(crate) fn dispatch(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Track(args) => tracking::run(TrackingConfig::try_from(args)?),
    }
}
