mod cli;
mod simulate;

use clap::Parser;
use cli::{Cli, Commands};
use fetchmux::config::Config;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cli = Cli::parse();

    let config = match &cli.command {
        Commands::Simulate(args) => match &args.config {
            Some(path) => Config::load_from_path(path.clone())?,
            None => Config::load()?,
        },
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.telemetry.log_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Simulate(args) => simulate::run(args, config).await?,
    }

    Ok(())
}
