use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use sync_engine::{ConflictStrategy, NetworkProfile};

#[derive(Debug, Parser)]
#[command(name = "rowkeeper-sync", version, about = "Sync project files against a SQLite document store")]
pub struct Cli {
    /// TOML file overriding the default sync constants.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[arg(long, global = true, value_enum, default_value_t = Profile::Desktop)]
    pub profile: Profile,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Profile {
    Mobile,
    Desktop,
}

impl Profile {
    pub fn network_profile(self) -> NetworkProfile {
        match self {
            Profile::Mobile => NetworkProfile::mobile(),
            Profile::Desktop => NetworkProfile::desktop(),
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Two-way merge of a local project file with the remote store.
    Merge {
        #[arg(long)]
        user: String,
        /// JSON array of projects.
        #[arg(long)]
        local: PathBuf,
        /// SQLite document store.
        #[arg(long)]
        remote: PathBuf,
        #[arg(long, default_value = "newest-wins")]
        strategy: ConflictStrategy,
        /// Where to write the merged projects (stdout when omitted).
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Pull remote changes made after `--since`.
    Incremental {
        #[arg(long)]
        user: String,
        #[arg(long)]
        local: PathBuf,
        #[arg(long)]
        remote: PathBuf,
        /// RFC 3339 timestamp of the last successful sync.
        #[arg(long)]
        since: DateTime<Utc>,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Push every local project, retrying per the active profile.
    Push {
        #[arg(long)]
        user: String,
        #[arg(long)]
        local: PathBuf,
        #[arg(long)]
        remote: PathBuf,
    },
    /// Upgrade legacy single-pattern projects to charts.
    Migrate {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Save a guest snapshot.
    Backup {
        #[arg(long)]
        identity: String,
        #[arg(long)]
        local: PathBuf,
        #[arg(long)]
        store: PathBuf,
        /// Id of the project open at backup time.
        #[arg(long)]
        current: Option<String>,
    },
    /// Restore a guest snapshot, optionally merged into an existing file.
    Restore {
        #[arg(long)]
        identity: String,
        #[arg(long)]
        store: PathBuf,
        #[arg(long)]
        merge_into: Option<PathBuf>,
        #[arg(long)]
        out: Option<PathBuf>,
    },
}
