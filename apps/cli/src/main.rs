//! TenderFlow CLI — tender-processing pipeline runner.
//!
//! Ingests free-text tenders, matches extracted requirements against the
//! catalog, computes a priced proposal, and renders the deliverable.

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
