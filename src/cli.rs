use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "fetchmux")]
#[command(about = "fetchmux CLI", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Drive simulated transfers through a multi and report the outcomes
    Simulate(SimulateArgs),
}

#[derive(clap::Args, Debug)]
pub struct SimulateArgs {
    /// Number of transfers to run
    #[arg(long, default_value_t = 16)]
    pub handles: usize,

    /// Every Nth transfer fails with a transfer-level error (0 = never)
    #[arg(long, default_value_t = 5)]
    pub fail_every: usize,

    /// Every Nth transfer is cancelled before it finishes (0 = never)
    #[arg(long, default_value_t = 7)]
    pub cancel_every: usize,

    /// Configuration file (defaults to FETCHMUX_CONFIG or config/fetchmux.toml)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Print the summary as JSON
    #[arg(long)]
    pub json: bool,
}
