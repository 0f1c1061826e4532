pub mod fit;

use clap::{Parser, Subcommand};

pub use fit::{FitArgs, VisibleType};

#[derive(Parser)]
#[command(name = "candle-sgvb")]
#[command(about = "Variational autoencoders trained by stochastic gradient variational Bayes")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Fit a feed-forward VAE to a data matrix
    Fit(FitArgs),
}
