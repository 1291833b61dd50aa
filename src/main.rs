//! rowkeeper-sync: command-line front end for the sync engine.
//!
//! Projects are exchanged as JSON arrays; the remote side is a SQLite
//! document store. Examples:
//!   rowkeeper-sync merge --user u1 --local projects.json --remote remote.db
//!   rowkeeper-sync --profile mobile push --user u1 --local projects.json --remote remote.db
//!   rowkeeper-sync backup --identity guest --local projects.json --store guest.db

mod cli;
mod commands;

use anyhow::{Context, Result};
use clap::Parser;
use sync_engine::SyncConfig;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Command};

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => SyncConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => SyncConfig::default(),
    };

    match cli.command {
        Command::Merge {
            user,
            local,
            remote,
            strategy,
            out,
        } => commands::merge(&config, &user, &local, &remote, strategy, out.as_deref()).await,
        Command::Incremental {
            user,
            local,
            remote,
            since,
            out,
        } => commands::incremental(&config, &user, &local, &remote, since, out.as_deref()).await,
        Command::Push { user, local, remote } => {
            commands::push(&config, cli.profile.network_profile(), &user, &local, &remote).await
        }
        Command::Migrate { input, out } => commands::migrate(&input, out.as_deref()),
        Command::Backup {
            identity,
            local,
            store,
            current,
        } => commands::backup(&identity, &local, &store, current.as_deref()),
        Command::Restore {
            identity,
            store,
            merge_into,
            out,
        } => commands::restore(&identity, &store, merge_into.as_deref(), out.as_deref()),
    }
}
