//! Engine configuration: where state lives and how patient the engine is.
//!
//! All paths and timing knobs for the safety engine are collected in
//! [`SafetyConfig`], which can be saved/loaded as JSON so the surrounding
//! CLI and the scheduler agree on the same state directory.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default emergency-stop grace period before SIGKILL escalation.
pub const DEFAULT_GRACE_PERIOD_SECS: u64 = 30;

/// Default bound on stop-signal polling latency.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 200;

/// Default staleness threshold for a session heartbeat.
pub const DEFAULT_HEARTBEAT_TIMEOUT_SECS: u64 = 120;

/// Configuration for the safety and rollback engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyConfig {
    /// Directory holding the session lock and other engine state
    pub state_dir: PathBuf,

    /// Directory holding backup trees (one subdirectory per backup id)
    pub backup_dir: PathBuf,

    /// Append-only operation journal (JSON lines)
    pub journal_path: PathBuf,

    /// Well-known stop-signal file, shared by every session on the machine
    pub stop_signal_path: PathBuf,

    /// Root under which tracked file targets live ("/" on a live machine)
    pub work_root: PathBuf,

    /// Seconds between SIGTERM and SIGKILL during emergency-stop escalation
    pub grace_period_secs: u64,

    /// Upper bound on stop-signal polling latency, in milliseconds
    pub poll_interval_ms: u64,

    /// A session heartbeat older than this is considered stale
    pub heartbeat_timeout_secs: u64,

    /// When set, package/service inverses are recorded but not executed
    pub dry_run: bool,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("/var/lib/maintguard"),
            backup_dir: PathBuf::from("/var/lib/maintguard/backups"),
            journal_path: PathBuf::from("/var/lib/maintguard/journal.log"),
            stop_signal_path: PathBuf::from("/run/maintguard/emergency_stop"),
            work_root: PathBuf::from("/"),
            grace_period_secs: DEFAULT_GRACE_PERIOD_SECS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            heartbeat_timeout_secs: DEFAULT_HEARTBEAT_TIMEOUT_SECS,
            dry_run: false,
        }
    }
}

impl SafetyConfig {
    /// Root every engine path under a single directory.
    ///
    /// Used by tests and containerized deployments where `/var/lib` and
    /// `/run` are not writable.
    pub fn at<P: AsRef<Path>>(base: P) -> Self {
        let base = base.as_ref();
        Self {
            state_dir: base.join("state"),
            backup_dir: base.join("backups"),
            journal_path: base.join("journal.log"),
            stop_signal_path: base.join("emergency_stop"),
            work_root: base.join("root"),
            ..Self::default()
        }
    }

    /// Save configuration to a JSON file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .context("Failed to serialize safety configuration to JSON")?;

        fs::write(&path, json)
            .with_context(|| format!("Failed to write configuration to {:?}", path.as_ref()))?;

        Ok(())
    }

    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read configuration from {:?}", path.as_ref()))?;

        let config: Self =
            serde_json::from_str(&content).context("Failed to parse configuration JSON")?;

        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.state_dir.as_os_str().is_empty() {
            anyhow::bail!("State directory must be specified");
        }
        if self.backup_dir.as_os_str().is_empty() {
            anyhow::bail!("Backup directory must be specified");
        }
        if self.journal_path.as_os_str().is_empty() {
            anyhow::bail!("Journal path must be specified");
        }
        if self.stop_signal_path.as_os_str().is_empty() {
            anyhow::bail!("Stop signal path must be specified");
        }
        if self.grace_period_secs == 0 {
            anyhow::bail!("Grace period must be at least 1 second");
        }
        if self.poll_interval_ms == 0 || self.poll_interval_ms > 1000 {
            anyhow::bail!("Poll interval must be between 1 and 1000 milliseconds");
        }
        if self.heartbeat_timeout_secs == 0 {
            anyhow::bail!("Heartbeat timeout must be at least 1 second");
        }
        Ok(())
    }

    /// Grace period as a [`Duration`]
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    /// Poll interval as a [`Duration`]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Heartbeat timeout as a [`Duration`]
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    /// Path of the exclusive session lock file
    pub fn session_lock_path(&self) -> PathBuf {
        self.state_dir.join("session.lock")
    }

    /// Path of the persisted worker-pid set, read by escalation from
    /// other processes
    pub fn worker_pids_path(&self) -> PathBuf {
        self.state_dir.join("workers.json")
    }

    /// Create the state, backup, and work directories if missing
    pub fn ensure_directories(&self) -> Result<()> {
        for dir in [&self.state_dir, &self.backup_dir, &self.work_root] {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create directory {:?}", dir))?;
        }
        if let Some(parent) = self.stop_signal_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {:?}", parent))?;
        }
        if let Some(parent) = self.journal_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {:?}", parent))?;
        }
        Ok(())
    }
}
