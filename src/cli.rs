use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// dashverify - apply the metrics dashboard manifest and verify the stack
#[derive(Parser)]
#[command(name = "dashverify")]
#[command(about = "Converge a metrics dashboard stack and verify its services respond")]
#[command(version)]
pub struct Cli {
    /// Configuration file (JSON). Defaults are used when omitted.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Dry-run mode: log the engine command instead of running it.
    ///
    /// Verification still probes the network, so `run --dry-run` against an
    /// already converged host re-checks it without touching it.
    #[arg(long, global = true)]
    pub dry_run: bool,

    /// Print the report as JSON instead of text
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Apply the manifest twice, then run the verification sequence
    Run {
        #[command(flatten)]
        apply: ApplyArgs,
    },
    /// Apply the manifest twice and check idempotence only
    Apply {
        #[command(flatten)]
        apply: ApplyArgs,
    },
    /// Run the verification sequence only
    Verify,
    /// Print the rendered manifest
    Manifest,
    /// Validate a configuration file
    Validate {
        /// Path to configuration file to validate
        config: PathBuf,
    },
    /// Write the default configuration to a file
    Init {
        /// Destination path
        path: PathBuf,
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(clap::Args, Debug, Clone, Default)]
pub struct ApplyArgs {
    /// Only require the second run to be non-fatal, not change-free
    #[arg(long)]
    pub lenient: bool,

    /// Skip the root and engine-binary checks
    #[arg(long)]
    pub skip_preflight: bool,
}

impl Cli {
    pub fn parse_args() -> Self {
        <Self as clap::Parser>::parse()
    }
}
