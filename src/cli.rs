use std::path::PathBuf;

use clap::{Args as ClapArgs, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct CatalogArgs {
    /// Catalog file (.json or .csv). Uses the bundled sample catalog if omitted.
    #[clap(short, long)]
    pub catalog: Option<PathBuf>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Rank catalog products by visual similarity to an image
    Match {
        /// Image URL (http/https) or data URI
        #[clap(short, long, allow_hyphen_values = true)]
        image: String,

        /// Minimum similarity [0.0, 1.0]. Without it the configured
        /// threshold is tried first and relaxed if nothing matches.
        #[clap(short, long)]
        threshold: Option<f32>,

        /// Print at most this many results
        #[clap(short, long)]
        limit: Option<usize>,

        #[clap(flatten)]
        catalog: CatalogArgs,
    },
    /// Compute and report vectors for every catalog product
    Precompute {
        #[clap(flatten)]
        catalog: CatalogArgs,
    },
    /// Load the model and extract a single image
    SelfTest {
        /// Image to extract. Defaults to the first sample catalog image.
        #[clap(short, long)]
        image: Option<String>,
    },
    /// Serve the HTTP API
    Serve {
        /// Address to listen on, overrides server.listen
        #[clap(short, long)]
        listen: Option<String>,

        #[clap(flatten)]
        catalog: CatalogArgs,
    },
}
