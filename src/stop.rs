//! Emergency-stop coordination: cooperative cancellation plus bounded
//! process termination.
//!
//! # Problem Solved
//! A maintenance sequence may be halfway through deleting caches or removing
//! packages when an operator (or a watchdog) decides the machine must be left
//! alone. Workers must stop making new changes quickly, and any child
//! processes they spawned must not keep running destructive commands after
//! the parent is gone.
//!
//! # Solution
//! - A single file-backed [`StopSignal`] observed by every session on the
//!   machine; raised by the coordinator, cleared only by an explicit reset
//! - A [`StopToken`] checked at every step boundary of tracked loops
//!   (bounded latency, one small file read per check)
//! - A [`WorkerRegistry`] of child PIDs; escalation sends SIGTERM to each
//!   process group, waits out a grace period, then SIGKILLs survivors
//! - OS signals (SIGINT/SIGTERM/SIGHUP) bridge into the same token

use crate::config::DEFAULT_GRACE_PERIOD_SECS;
use crate::error::{Result, SafetyError};
use crate::journal::{EventSeverity, OperationJournal};
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use nix::libc;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

/// Global registry of worker (child) process IDs.
/// Using OnceLock for safe lazy initialization.
static WORKER_REGISTRY: OnceLock<Arc<Mutex<WorkerRegistry>>> = OnceLock::new();

/// Global token tripped by the OS-signal bridge.
static SIGNAL_TOKEN: OnceLock<StopToken> = OnceLock::new();

/// The machine-wide stop signal, persisted as a single line:
/// `EMERGENCY_STOP:<reason>:<iso8601-timestamp>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopSignal {
    pub reason: String,
    pub raised_at: DateTime<Utc>,
}

impl StopSignal {
    const PREFIX: &'static str = "EMERGENCY_STOP";

    /// Serialize to the single-line wire form
    pub fn to_line(&self) -> String {
        format!(
            "{}:{}:{}",
            Self::PREFIX,
            self.reason,
            self.raised_at.to_rfc3339()
        )
    }

    /// Parse the single-line wire form. The reason itself may contain `:`
    /// and the RFC 3339 timestamp certainly does, so the split point is the
    /// leftmost separator whose suffix parses as a timestamp.
    pub fn parse(line: &str) -> Option<Self> {
        let rest = line.trim().strip_prefix(Self::PREFIX)?.strip_prefix(':')?;
        for (idx, _) in rest.match_indices(':') {
            let (reason, timestamp) = (&rest[..idx], &rest[idx + 1..]);
            if let Ok(parsed) = DateTime::parse_from_rfc3339(timestamp) {
                return Some(Self {
                    reason: reason.to_string(),
                    raised_at: parsed.with_timezone(&Utc),
                });
            }
        }
        None
    }

    /// Read the signal file; `None` when not raised or unreadable
    pub fn read(path: &Path) -> Option<Self> {
        let content = fs::read_to_string(path).ok()?;
        Self::parse(&content)
    }

    /// Atomically write the signal file (tmp + rename)
    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, format!("{}\n", self.to_line()))?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

/// Cancellation token consulted at every step boundary of tracked loops.
///
/// Combines an in-process flag (set by the OS-signal bridge) with the
/// file-backed machine-wide signal. `check()` costs one small file read,
/// keeping observation latency well inside the 200 ms polling bound.
#[derive(Debug, Clone)]
pub struct StopToken {
    flag: Arc<AtomicBool>,
    signal_path: Option<PathBuf>,
}

impl StopToken {
    /// Token observing the signal file at `path`
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            signal_path: Some(path.as_ref().to_path_buf()),
        }
    }

    /// Token with no file backing; stops only if tripped in-process.
    /// Used by standalone backup/restore invocations and tests.
    pub fn inert() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            signal_path: None,
        }
    }

    /// True once a stop has been observed
    pub fn check(&self) -> bool {
        if self.flag.load(Ordering::SeqCst) {
            return true;
        }
        match &self.signal_path {
            Some(path) => StopSignal::read(path).is_some(),
            None => false,
        }
    }

    /// Reason attached to the observed stop, if any
    pub fn reason(&self) -> Option<String> {
        if self.flag.load(Ordering::SeqCst) {
            return Some("signal received".to_string());
        }
        self.signal_path
            .as_deref()
            .and_then(StopSignal::read)
            .map(|s| s.reason)
    }

    /// Error out with [`SafetyError::EmergencyStop`] if the stop is raised.
    /// Called at step boundaries before making any new tracked change.
    pub fn ensure_clear(&self) -> Result<()> {
        if self.check() {
            return Err(SafetyError::EmergencyStop {
                reason: self
                    .reason()
                    .unwrap_or_else(|| "unspecified".to_string()),
            });
        }
        Ok(())
    }

    /// Trip the in-process flag (signal bridge, tests)
    pub fn trip(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }
}

/// Registry tracking all spawned worker processes.
///
/// The pid set can be mirrored to a file under the engine state directory,
/// so a coordinator in another process (`stop --escalate` from an operator
/// shell) can escalate against workers it did not spawn itself.
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    /// Set of worker PIDs currently running
    pids: HashSet<u32>,
    /// Whether escalation has already been initiated (prevent double-kill)
    escalation_initiated: bool,
    /// When bound, every pid-set change is mirrored to this file
    state_path: Option<PathBuf>,
}

impl WorkerRegistry {
    /// Get or create the global worker registry
    pub fn global() -> Arc<Mutex<WorkerRegistry>> {
        WORKER_REGISTRY
            .get_or_init(|| Arc::new(Mutex::new(WorkerRegistry::default())))
            .clone()
    }

    /// Mirror the pid set to `path` on every change. The active session
    /// binds the global registry so escalation from another process can
    /// reach its workers.
    pub fn bind(&mut self, path: PathBuf) {
        self.state_path = Some(path);
        self.persist();
    }

    /// Merge pids persisted by another process and adopt the file, so the
    /// post-escalation state is written back for the next observer.
    pub fn adopt_persisted(&mut self, path: &Path) {
        if let Ok(content) = fs::read_to_string(path) {
            if let Ok(pids) = serde_json::from_str::<Vec<u32>>(&content) {
                for pid in pids {
                    self.pids.insert(pid);
                }
            }
        }
        self.state_path = Some(path.to_path_buf());
    }

    fn persist(&self) {
        let Some(path) = &self.state_path else {
            return;
        };
        let mut pids: Vec<u32> = self.pids.iter().copied().collect();
        pids.sort_unstable();
        let json = match serde_json::to_string(&pids) {
            Ok(json) => json,
            Err(_) => return,
        };
        let write = || -> std::io::Result<()> {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let tmp = path.with_extension("tmp");
            fs::write(&tmp, json)?;
            fs::rename(&tmp, path)
        };
        if let Err(e) = write() {
            warn!("Failed to persist worker pids to {}: {}", path.display(), e);
        }
    }

    /// Register a worker process
    pub fn register(&mut self, pid: u32) {
        self.pids.insert(pid);
        self.persist();
        debug!("Registered worker process PID {}", pid);
    }

    /// Unregister a worker process (called when it exits normally)
    pub fn unregister(&mut self, pid: u32) {
        self.pids.remove(&pid);
        self.persist();
        debug!("Unregistered worker process PID {}", pid);
    }

    /// Number of tracked workers
    pub fn count(&self) -> usize {
        self.pids.len()
    }

    /// Allow escalation to run again (a new session begins tracking)
    pub fn rearm(&mut self) {
        self.escalation_initiated = false;
    }

    /// Terminate all tracked workers.
    /// Sends SIGTERM to each process group first, waits up to `grace_period`,
    /// then SIGKILLs survivors.
    pub fn terminate_all(&mut self, grace_period: Duration) {
        if self.escalation_initiated {
            debug!("Escalation already initiated, skipping");
            return;
        }
        self.escalation_initiated = true;

        if self.pids.is_empty() {
            debug!("No worker processes to terminate");
            return;
        }

        info!("Terminating {} worker process(es)...", self.pids.len());

        // First pass: SIGTERM to process GROUPS so grandchildren (pacman,
        // systemctl, rm trees) receive the signal too
        let pids_to_kill: Vec<u32> = self.pids.iter().copied().collect();
        for &pid in &pids_to_kill {
            if let Err(e) = send_signal_to_group(pid, Signal::SIGTERM) {
                warn!("Failed to send SIGTERM to process group {}: {}", pid, e);
                if let Err(e2) = send_signal(pid, Signal::SIGTERM) {
                    warn!("Failed to send SIGTERM to PID {}: {}", pid, e2);
                }
            } else {
                debug!("Sent SIGTERM to process group {}", pid);
            }
        }

        // Wait out the grace period, checking for voluntary exits
        let start = Instant::now();
        while start.elapsed() < grace_period {
            let still_alive: Vec<u32> = pids_to_kill
                .iter()
                .filter(|&&pid| is_process_alive(pid))
                .copied()
                .collect();

            if still_alive.is_empty() {
                info!("All worker processes terminated gracefully");
                self.pids.clear();
                self.persist();
                return;
            }

            std::thread::sleep(Duration::from_millis(100));
        }

        // Second pass: SIGKILL any remaining process groups
        for &pid in &pids_to_kill {
            if is_process_alive(pid) {
                warn!("Process group {} did not terminate, sending SIGKILL", pid);
                if let Err(e) = send_signal_to_group(pid, Signal::SIGKILL) {
                    error!("Failed to send SIGKILL to process group {}: {}", pid, e);
                    let _ = send_signal(pid, Signal::SIGKILL);
                }
            }
        }

        self.pids.clear();
        self.persist();
        info!("Worker process escalation complete");
    }
}

/// Send a signal to a process
fn send_signal(pid: u32, signal: Signal) -> std::result::Result<(), nix::Error> {
    signal::kill(Pid::from_raw(pid as i32), signal)
}

/// Send a signal to an entire process group (negative PID)
fn send_signal_to_group(pgid: u32, signal: Signal) -> std::result::Result<(), nix::Error> {
    signal::kill(Pid::from_raw(-(pgid as i32)), signal)
}

/// Check if a process is still alive (not dead or zombie)
pub(crate) fn is_process_alive(pid: u32) -> bool {
    if signal::kill(Pid::from_raw(pid as i32), None).is_err() {
        return false;
    }

    // A zombie can still receive signals but isn't running; field 3 of
    // /proc/pid/stat is the state letter
    if let Ok(stat) = std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        let fields: Vec<&str> = stat.split_whitespace().collect();
        if fields.len() > 2 {
            return !matches!(fields[2], "Z" | "X");
        }
    }

    // If we can't read /proc, assume alive (safe default)
    true
}

/// Coordinator state: `Normal` until a raise, `Stopped` until an explicit
/// reset. Workers never clear the signal themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopState {
    Normal,
    Stopped,
}

/// Owns the write side of the stop protocol.
///
/// Any number of [`StopToken`]s may observe the signal concurrently; only
/// the coordinator writes it.
pub struct EmergencyStopCoordinator {
    signal_path: PathBuf,
    grace_period: Duration,
    worker_pids_path: Option<PathBuf>,
}

impl EmergencyStopCoordinator {
    /// Coordinator writing the signal at `signal_path`
    pub fn new<P: AsRef<Path>>(signal_path: P, grace_period: Duration) -> Self {
        Self {
            signal_path: signal_path.as_ref().to_path_buf(),
            grace_period,
            worker_pids_path: None,
        }
    }

    /// Escalate against the worker pids persisted at `path` as well as the
    /// in-process registry. Lets `stop --escalate` from an operator shell
    /// reach workers spawned by the active session in another process.
    pub fn with_worker_pids_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.worker_pids_path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Current state as derived from the signal file
    pub fn state(&self) -> StopState {
        match StopSignal::read(&self.signal_path) {
            Some(_) => StopState::Stopped,
            None => StopState::Normal,
        }
    }

    /// The signal currently raised, if any
    pub fn signal(&self) -> Option<StopSignal> {
        StopSignal::read(&self.signal_path)
    }

    /// A token observing this coordinator's signal file
    pub fn token(&self) -> StopToken {
        StopToken::new(&self.signal_path)
    }

    /// Raise the emergency stop: write the signal and journal a
    /// `SAFETY_ERROR` event. Idempotent: re-raising while already stopped
    /// keeps the original signal and returns without rewriting.
    pub fn raise(
        &self,
        reason: &str,
        journal: &OperationJournal,
        session_id: Option<&str>,
    ) -> Result<StopSignal> {
        if let Some(existing) = self.signal() {
            debug!("Emergency stop already raised ({}), no-op", existing.reason);
            return Ok(existing);
        }

        let signal = StopSignal {
            reason: reason.to_string(),
            raised_at: Utc::now(),
        };
        signal.write(&self.signal_path)?;
        journal.append_event(
            EventSeverity::SafetyError,
            format!("EMERGENCY_STOP:{}", reason),
            session_id,
        )?;
        warn!("Emergency stop raised: {}", reason);
        Ok(signal)
    }

    /// Escalate against workers that have not exited: SIGTERM each process
    /// group, wait out the grace period, SIGKILL survivors. Blocks up to the
    /// grace period. Safe to call when nothing is registered.
    pub fn escalate(&self) {
        if let Ok(mut registry) = WorkerRegistry::global().lock() {
            if let Some(path) = &self.worker_pids_path {
                registry.adopt_persisted(path);
            }
            registry.terminate_all(self.grace_period);
        }
    }

    /// Explicit `Stopped → Normal` transition. Removes the signal file.
    pub fn reset(&self, journal: &OperationJournal) -> Result<()> {
        match fs::remove_file(&self.signal_path) {
            Ok(()) => {
                journal.append_event(EventSeverity::Info, "emergency stop reset", None)?;
                info!("Emergency stop reset");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Default grace period when none is configured
    pub fn default_grace_period() -> Duration {
        Duration::from_secs(DEFAULT_GRACE_PERIOD_SECS)
    }
}

/// Initialize global signal handlers bridging SIGINT, SIGTERM, and SIGHUP
/// into the cooperative stop token, then tearing down workers.
/// Call this once at program start.
pub fn init_signal_handlers(token: StopToken) -> std::result::Result<(), std::io::Error> {
    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;
    use std::thread;

    let _ = SIGNAL_TOKEN.set(token);
    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])?;

    thread::spawn(move || {
        for sig in signals.forever() {
            let signal_name = match sig {
                SIGINT => "SIGINT",
                SIGTERM => "SIGTERM",
                SIGHUP => "SIGHUP",
                _ => "UNKNOWN",
            };

            info!("Received {} signal, stopping workers...", signal_name);

            if let Some(token) = SIGNAL_TOKEN.get() {
                token.trip();
            }

            if let Ok(mut registry) = WorkerRegistry::global().lock() {
                registry.terminate_all(Duration::from_secs(3));
            }

            // Exit with 128 + signal number
            std::process::exit(128 + sig);
        }
    });

    Ok(())
}

/// Extension trait for std::process::Command to set up process groups.
pub trait CommandProcessGroup {
    /// Configure the command to run in its own process group so the whole
    /// process tree can be signaled at once
    fn in_new_process_group(&mut self) -> &mut Self;
}

impl CommandProcessGroup for std::process::Command {
    fn in_new_process_group(&mut self) -> &mut Self {
        use std::os::unix::process::CommandExt;
        unsafe {
            self.pre_exec(|| {
                // New process group with PGID = child PID
                nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0))
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;

                // Death signal: the child must not outlive the engine and
                // keep running a destructive command unsupervised
                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) == -1 {
                    return Err(std::io::Error::last_os_error());
                }

                Ok(())
            });
        }
        self
    }
}
