//! Image mount CLI - runs the mount daemon.
//!
//! `daemon` keeps scanning until it receives a termination signal or finds the
//! stop file; `once` performs a single pass and unmounts everything again.

mod daemon;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use imagemount_core::DEFAULT_CONFIG_PATH;

/// Disk image mount daemon.
#[derive(Parser)]
#[command(name = "imagemount-cli")]
#[command(about = "Mounts disk images and installs the games they contain", long_about = None)]
struct Cli {
    /// TOML configuration file. Defaults apply when it does not exist.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scan loop until stopped.
    ///
    /// Stops on SIGTERM, SIGINT, SIGHUP, SIGQUIT or when the stop file
    /// appears in the state directory. Every mount is torn down on exit.
    Daemon,
    /// Run one reconcile and scan pass, then tear everything down.
    Once,
}

fn main() {
    let cli = Cli::parse();

    let mode = match cli.command {
        Commands::Daemon => daemon::Mode::Loop,
        Commands::Once => daemon::Mode::Once,
    };
    if let Err(e) = daemon::run(&cli.config, mode) {
        eprintln!("Daemon error: {}", e);
        std::process::exit(1);
    }
}
