//! catalogsync CLI: vendor catalog ingestion and search-index sync.
//!
//! Pulls a vendor's product listing, filters and normalizes it, reconciles
//! product descriptions and keeps the storefront search index in step.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
