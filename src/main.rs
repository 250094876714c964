use anyhow::Result;
use clap::{Parser, Subcommand};

use rtview::{export, serve, volume};

#[derive(Parser, Debug)]
#[command(name = "rtview", about = "Real-time microscopy acquisition viewer engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve overview, composite, and map-view endpoints over HTTP
    Serve(serve::ServeArgs),
    /// Write the overview pyramid for one z/channel to disk
    Export(export::ExportArgs),
    /// Dump a downsampled volume that fits a memory budget
    Volume(volume::VolumeArgs),
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Command::Serve(args) => serve::run(args),
        Command::Export(args) => export::run(args),
        Command::Volume(args) => volume::run(args),
    }
}
