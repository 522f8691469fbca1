//! cachesync-cli: compares peers' consistency hashes, lists changed keys
//! and triggers reloads over the admin HTTP surface.
#![deny(clippy::all, clippy::pedantic)]

mod args;
mod client;
mod handlers;
mod print;

use cachesync::{config, telemetry};
use clap::Parser;

use args::{Cli, Commands};
use client::{CliError, Ctx};

#[tokio::main]
async fn main() -> Result<(), CliError> {
    let cli = Cli::parse();
    let settings = config::load(cli.config.as_deref(), &cli.overrides)?;
    telemetry::init(&settings.logging)?;
    let ctx = Ctx::new(&settings.consistency)?;

    match cli.command {
        Commands::CheckHash { dataset } => handlers::check_hash(&ctx, dataset.as_deref()).await?,
        Commands::Changes { start, end, peer } => {
            handlers::changes(&ctx, peer.as_ref(), &start, &end).await?;
        }
        Commands::Refresh { dataset, peer } => {
            handlers::refresh(&ctx, peer.as_ref(), dataset.as_deref()).await?;
        }
    }

    Ok(())
}
