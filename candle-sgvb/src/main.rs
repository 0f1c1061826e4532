use anyhow::Result;
use candle_sgvb::cli::{fit, Cli, Commands};
use clap::Parser;

fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Fit(args) => {
            fit::run(args)?;
        }
    }

    Ok(())
}
