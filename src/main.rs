//! maintguard - Main entry point
//!
//! Thin operator surface over the safety engine: stop-signal control,
//! backup verification, and journal inspection. Rollback itself runs inside
//! the process that owns the active session, through the library facade.

use anyhow::Context;
use log::{debug, info, warn};

use maintguard::backup::BackupStore;
use maintguard::cli::{Cli, Commands};
use maintguard::config::SafetyConfig;
use maintguard::journal::{OperationFilter, OperationJournal};
use maintguard::stop::{self, EmergencyStopCoordinator, StopState, StopToken};
use maintguard::types::OperationKind;

/// Initialize the logger with appropriate settings
fn init_logger() {
    use env_logger::Builder;
    use std::io::Write;

    Builder::from_default_env()
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {}:{}] {}",
                record.level(),
                record.file().unwrap_or("unknown"),
                record.line().unwrap_or(0),
                record.args()
            )
        })
        .filter_level(log::LevelFilter::Info)
        .parse_default_env() // Allows RUST_LOG env var to override
        .init();
}

fn load_config(cli: &Cli) -> anyhow::Result<SafetyConfig> {
    let mut config = match &cli.config {
        Some(path) => SafetyConfig::load_from_file(path)?,
        None => SafetyConfig::default(),
    };
    config.dry_run = config.dry_run || cli.dry_run;
    config.validate()?;
    Ok(config)
}

fn run(cli: Cli) -> anyhow::Result<i32> {
    let config = load_config(&cli)?;

    // Bridge SIGINT/SIGTERM/SIGHUP into the stop token and worker teardown.
    // Built after config loading so the token watches the configured
    // signal path, not the default one.
    let token = StopToken::new(&config.stop_signal_path);
    if let Err(e) = stop::init_signal_handlers(token) {
        warn!("Failed to initialize signal handlers: {}", e);
        // Continue anyway - cooperative checks still work
    }
    debug!("Signal handlers initialized");

    match cli.command {
        Commands::Status => {
            let coordinator = EmergencyStopCoordinator::new(
                &config.stop_signal_path,
                config.grace_period(),
            );
            match coordinator.signal() {
                Some(signal) => println!(
                    "emergency stop: RAISED ({}, at {})",
                    signal.reason,
                    signal.raised_at.to_rfc3339()
                ),
                None => println!("emergency stop: clear"),
            }

            match std::fs::read_to_string(config.session_lock_path()) {
                Ok(lock) => println!("session lock:\n{}", lock.trim_end()),
                Err(_) => println!("session lock: none"),
            }

            let store = BackupStore::open(&config.backup_dir)?;
            let backups = store.list()?;
            println!("backups: {}", backups.len());
            for meta in backups {
                println!(
                    "  {} {:?} {}{}",
                    meta.id,
                    meta.kind,
                    meta.created_at.to_rfc3339(),
                    if meta.corrupted { " CORRUPTED" } else { "" }
                );
            }
            Ok(0)
        }

        Commands::Stop { reason, escalate } => {
            let journal = OperationJournal::open(&config.journal_path)?;
            let coordinator = EmergencyStopCoordinator::new(
                &config.stop_signal_path,
                config.grace_period(),
            )
            // Workers registered by the active session live in another
            // process; escalation finds them through the persisted pid set
            .with_worker_pids_file(config.worker_pids_path());
            coordinator
                .raise(&reason, &journal, None)
                .context("Failed to raise emergency stop")?;
            info!("Emergency stop raised: {}", reason);
            if escalate {
                warn!("Escalating against registered workers");
                coordinator.escalate();
            }
            Ok(0)
        }

        Commands::ResetStop => {
            let journal = OperationJournal::open(&config.journal_path)?;
            let coordinator = EmergencyStopCoordinator::new(
                &config.stop_signal_path,
                config.grace_period(),
            );
            if coordinator.state() == StopState::Normal {
                println!("emergency stop already clear");
            } else {
                coordinator.reset(&journal)?;
                println!("emergency stop cleared");
            }
            Ok(0)
        }

        Commands::VerifyBackup { id } => {
            let store = BackupStore::open(&config.backup_dir)?;
            if store.verify(&id)? {
                println!("backup {} verified", id);
                Ok(0)
            } else {
                // Corrupted backups are retained; the exit code flags them
                eprintln!("backup {} FAILED verification (retained for forensics)", id);
                Ok(1)
            }
        }

        Commands::Backups => {
            let store = BackupStore::open(&config.backup_dir)?;
            for meta in store.list()? {
                println!(
                    "{} {:?} base={} {}{}",
                    meta.id,
                    meta.kind,
                    meta.base_ref.as_deref().unwrap_or("-"),
                    meta.created_at.to_rfc3339(),
                    if meta.corrupted { " CORRUPTED" } else { "" }
                );
            }
            Ok(0)
        }

        Commands::Journal { session, kind } => {
            let journal = OperationJournal::open(&config.journal_path)?;
            let mut filter = OperationFilter::default();
            if let Some(kind) = kind {
                let kind: OperationKind = kind
                    .parse()
                    .map_err(|e: String| anyhow::anyhow!(e))?;
                filter.kinds.push(kind);
            }
            for op in journal.query(&session, &filter)? {
                println!(
                    "{} {} {} {}",
                    op.timestamp.to_rfc3339(),
                    op.id,
                    op.kind,
                    op.target
                );
            }
            Ok(0)
        }
    }
}

fn main() {
    init_logger();
    info!("maintguard starting up");

    let cli = Cli::parse_args();
    let code = match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {:#}", e);
            1
        }
    };
    std::process::exit(code);
}
