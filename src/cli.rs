//! huepipe command line, built on clap.
//!
//! Defines [`Cli`] with the [`Command`] subcommands (run, inspect, config)
//! and global flags (--config, --verbose).

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// huepipe: summarize the prevalent colors of a batch of remote images.
#[derive(Debug, Parser)]
#[command(name = "huepipe", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Path to the configuration file.
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Download, summarize and record every image URL listed in SOURCE.
    Run {
        /// File with one image URL per line.
        source: PathBuf,

        /// CSV file the summaries are written to.
        output: PathBuf,

        /// Download workers.
        #[arg(long)]
        download_workers: Option<usize>,

        /// Summarize workers.
        #[arg(long)]
        summarize_workers: Option<usize>,

        /// Cleanup workers.
        #[arg(long)]
        cleanup_workers: Option<usize>,

        /// Per-download timeout in seconds.
        #[arg(long)]
        timeout_secs: Option<u64>,

        /// Print the run report as JSON when done.
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Summarize a single local image file.
    Inspect {
        /// Path to the image.
        image: PathBuf,
    },

    /// Print the effective configuration.
    Config,
}
