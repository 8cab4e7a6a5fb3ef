use clap::{Parser, Subcommand};
use std::path::PathBuf;
use streamcoder::TargetFormat;

#[derive(Parser)]
#[command(name = "streamcoder")]
#[command(author, version, about = "Read encoded media while it is still being encoded")]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Encode a source once and copy the output to every destination concurrently
    Copy {
        /// Source media file
        source: PathBuf,

        /// Destination files, one concurrent reader each
        #[arg(required = true)]
        dests: Vec<PathBuf>,

        /// Target format (defaults to the configured one)
        #[arg(short, long)]
        format: Option<TargetFormat>,
    },

    /// Show the artifacts and encode state of a source
    Status {
        /// Source media file
        source: PathBuf,

        /// Target format (defaults to the configured one)
        #[arg(short, long)]
        format: Option<TargetFormat>,
    },

    /// Remove artifacts left behind by a crashed encode
    Clean {
        /// Source media file
        source: PathBuf,

        /// Target format (defaults to the configured one)
        #[arg(short, long)]
        format: Option<TargetFormat>,
    },

    /// Check that the configured encoder is available
    CheckTools,

    /// Validate configuration file
    Validate {
        /// Config file to validate (uses default if not specified)
        config: Option<PathBuf>,
    },
}
