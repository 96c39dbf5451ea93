use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "bsa-worker")]
#[command(about = "Run knowledge artifacts against patient data and drain deferred actions")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file (overrides BSA_CONFIG env var)
    #[arg(short, long, global = true)]
    pub config: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Load and register every artifact definition, then exit
    Validate(ValidateArgs),
    /// Raise a named event for a patient and run the resume worker
    Run(RunArgs),
    /// Print the effective configuration as TOML
    ShowConfig,
}

#[derive(clap::Args)]
pub struct ValidateArgs {
    /// Artifact directory (overrides artifacts.dir)
    #[arg(short, long)]
    pub artifacts: Option<PathBuf>,
}

#[derive(clap::Args)]
pub struct RunArgs {
    /// FHIR bundle holding the patient and their clinical data
    #[arg(short, long)]
    pub patient: PathBuf,

    /// Named event to raise (e.g. encounter-close)
    #[arg(short, long)]
    pub event: String,

    /// Only run this artifact; all loaded artifacts otherwise
    #[arg(long)]
    pub artifact: Option<String>,

    /// Artifact directory (overrides artifacts.dir)
    #[arg(long)]
    pub artifacts: Option<PathBuf>,

    /// Run timed actions immediately instead of scheduling them
    #[arg(long)]
    pub ignore_timers: bool,

    /// Exit once no resume task is pending instead of waiting for Ctrl-C
    #[arg(long)]
    pub until_idle: bool,
}
