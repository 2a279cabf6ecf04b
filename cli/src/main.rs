mod cli;
mod commands;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
  let cli_args = Cli::parse();

  let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli_args.log));
  tracing_subscriber::fmt().with_env_filter(env_filter).with_target(true).init();

  match cli_args.command {
    Commands::Classify(args) => commands::classify::run(args),
    Commands::Simulate(args) => commands::simulate::run(args),
  }
}
