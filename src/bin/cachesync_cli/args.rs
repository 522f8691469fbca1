//! Command-line surface for `cachesync-cli`.

#![deny(clippy::all, clippy::pedantic)]

use std::path::PathBuf;

use cachesync::config::SettingsOverrides;
use clap::{Parser, Subcommand};
use url::Url;

#[derive(Parser, Debug)]
#[command(
    name = "cachesync-cli",
    version,
    about = "Inspect and repair cachesync peers",
    long_about = None
)]
pub struct Cli {
    /// Configuration file layered over `config/default` and `cachesync`.
    #[arg(long, env = "CACHESYNC_CONFIG", value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: SettingsOverrides,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Compare consistency hashes across every configured peer
    CheckHash {
        /// Compare one dataset instead of all of them
        #[arg(long)]
        dataset: Option<String>,
    },
    /// Print the change-log records of a time window
    Changes {
        /// Window start: epoch milliseconds or RFC 3339
        #[arg(long)]
        start: String,
        /// Window end: epoch milliseconds or RFC 3339
        #[arg(long)]
        end: String,
        /// Peer to ask; defaults to the first configured host
        #[arg(long)]
        peer: Option<Url>,
    },
    /// Ask a peer to reload one or every dataset
    Refresh {
        #[arg(long)]
        dataset: Option<String>,
        /// Peer to ask; defaults to the first configured host
        #[arg(long)]
        peer: Option<Url>,
    },
}
