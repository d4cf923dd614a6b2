use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// maintguard - safety and rollback engine for system maintenance
#[derive(Parser)]
#[command(name = "maintguard")]
#[command(about = "Inspect and control the maintenance safety engine")]
#[command(version)]
pub struct Cli {
    /// Path to an engine configuration file (JSON). Defaults apply when
    /// omitted.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Dry-run mode: package/service inverses are recorded, not executed
    #[arg(long, global = true)]
    pub dry_run: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show the active session, stop-signal state, and backup inventory
    Status,

    /// Raise the machine-wide emergency stop
    Stop {
        /// Reason recorded in the stop signal and the journal
        reason: String,

        /// Also escalate immediately: SIGTERM registered workers, SIGKILL
        /// after the grace period
        #[arg(long)]
        escalate: bool,
    },

    /// Clear a raised emergency stop (explicit reset)
    ResetStop,

    /// Verify a backup against its checksum manifest
    VerifyBackup {
        /// Backup id to verify
        id: String,
    },

    /// List backups in the store, newest first
    Backups,

    /// Print journal records for a session
    Journal {
        /// Session id to query
        session: String,

        /// Restrict to one operation kind (e.g. file_delete)
        #[arg(long)]
        kind: Option<String>,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
