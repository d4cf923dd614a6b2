//! Capability seams for package and service inverses.
//!
//! The engine does not know package or service semantics; it dispatches
//! inverse actions through these traits. Production wiring uses the shelling
//! implementations below; tests (and `--dry-run`) inject the recording
//! fakes instead of manipulating `PATH`.

use crate::stop::{CommandProcessGroup, WorkerRegistry};
use anyhow::{Context, Result};
use log::info;
use std::process::{Command, Stdio};
use std::sync::Mutex;

/// Installs and removes packages on behalf of rollback.
pub trait PackageManager: Send + Sync {
    /// Install a package; `version` pins a specific prior version when the
    /// inverse descriptor recorded one
    fn install(&self, name: &str, version: Option<&str>) -> Result<()>;

    /// Remove a package
    fn remove(&self, name: &str) -> Result<()>;
}

/// Starts and stops services on behalf of rollback.
pub trait ServiceManager: Send + Sync {
    fn start(&self, name: &str) -> Result<()>;
    fn stop(&self, name: &str) -> Result<()>;
}

fn run_managed(program: &str, args: &[&str]) -> Result<()> {
    info!("run_managed: {} {:?}", program, args);

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .in_new_process_group(); // emergency-stop escalation can reach it

    let child = cmd
        .spawn()
        .with_context(|| format!("Failed to spawn {}", program))?;
    let pid = child.id();

    {
        let registry = WorkerRegistry::global();
        let mut guard = registry.lock().expect("WorkerRegistry mutex poisoned");
        guard.register(pid);
    }

    let output = child
        .wait_with_output()
        .with_context(|| format!("Failed waiting for {}", program))?;

    {
        let registry = WorkerRegistry::global();
        let mut guard = registry.lock().expect("WorkerRegistry mutex poisoned");
        guard.unregister(pid);
    }

    if output.status.success() {
        Ok(())
    } else {
        let code = output.status.code().unwrap_or(-1);
        anyhow::bail!(
            "{} failed (exit code {}): {}",
            program,
            code,
            String::from_utf8_lossy(&output.stderr).trim()
        )
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        anyhow::bail!("Package/service name must not be empty");
    }
    if name.starts_with('-') {
        anyhow::bail!("Package/service name must not start with '-': {}", name);
    }
    Ok(())
}

/// Package manager shelling out to the system tool (pacman by default).
pub struct SystemPackageManager {
    program: String,
}

impl SystemPackageManager {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for SystemPackageManager {
    fn default() -> Self {
        Self::new("pacman")
    }
}

impl PackageManager for SystemPackageManager {
    fn install(&self, name: &str, version: Option<&str>) -> Result<()> {
        validate_name(name)?;
        let spec = match version {
            Some(v) => format!("{}={}", name, v),
            None => name.to_string(),
        };
        run_managed(&self.program, &["-S", "--noconfirm", &spec])
    }

    fn remove(&self, name: &str) -> Result<()> {
        validate_name(name)?;
        run_managed(&self.program, &["-R", "--noconfirm", name])
    }
}

/// Service manager shelling out to systemctl.
pub struct SystemServiceManager {
    program: String,
}

impl SystemServiceManager {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for SystemServiceManager {
    fn default() -> Self {
        Self::new("systemctl")
    }
}

impl ServiceManager for SystemServiceManager {
    fn start(&self, name: &str) -> Result<()> {
        validate_name(name)?;
        run_managed(&self.program, &["start", name])
    }

    fn stop(&self, name: &str) -> Result<()> {
        validate_name(name)?;
        run_managed(&self.program, &["stop", name])
    }
}

/// Recording fake: logs every call instead of touching the system.
///
/// Backs `--dry-run` and the test suites. `fail_on` makes a named target
/// fail, for exercising rollback's halt-on-first-failure path.
#[derive(Debug, Default)]
pub struct RecordingPackageManager {
    pub calls: Mutex<Vec<String>>,
    pub fail_on: Option<String>,
}

impl RecordingPackageManager {
    pub fn failing_on(name: impl Into<String>) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail_on: Some(name.into()),
        }
    }

    fn record(&self, call: String, name: &str) -> Result<()> {
        self.calls.lock().expect("calls mutex poisoned").push(call);
        if self.fail_on.as_deref() == Some(name) {
            anyhow::bail!("injected failure for {}", name);
        }
        Ok(())
    }

    pub fn recorded(&self) -> Vec<String> {
        self.calls.lock().expect("calls mutex poisoned").clone()
    }
}

impl PackageManager for RecordingPackageManager {
    fn install(&self, name: &str, version: Option<&str>) -> Result<()> {
        validate_name(name)?;
        let call = match version {
            Some(v) => format!("install {}={}", name, v),
            None => format!("install {}", name),
        };
        self.record(call, name)
    }

    fn remove(&self, name: &str) -> Result<()> {
        validate_name(name)?;
        self.record(format!("remove {}", name), name)
    }
}

/// Recording fake for service operations.
#[derive(Debug, Default)]
pub struct RecordingServiceManager {
    pub calls: Mutex<Vec<String>>,
    pub fail_on: Option<String>,
}

impl RecordingServiceManager {
    pub fn failing_on(name: impl Into<String>) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail_on: Some(name.into()),
        }
    }

    fn record(&self, call: String, name: &str) -> Result<()> {
        self.calls.lock().expect("calls mutex poisoned").push(call);
        if self.fail_on.as_deref() == Some(name) {
            anyhow::bail!("injected failure for {}", name);
        }
        Ok(())
    }

    pub fn recorded(&self) -> Vec<String> {
        self.calls.lock().expect("calls mutex poisoned").clone()
    }
}

impl ServiceManager for RecordingServiceManager {
    fn start(&self, name: &str) -> Result<()> {
        validate_name(name)?;
        self.record(format!("start {}", name), name)
    }

    fn stop(&self, name: &str) -> Result<()> {
        validate_name(name)?;
        self.record(format!("stop {}", name), name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_package_manager_logs_calls() {
        let pm = RecordingPackageManager::default();
        pm.install("nginx", Some("1.24.0-1")).unwrap();
        pm.remove("htop").unwrap();
        assert_eq!(pm.recorded(), vec!["install nginx=1.24.0-1", "remove htop"]);
    }

    #[test]
    fn test_injected_failure() {
        let pm = RecordingPackageManager::failing_on("nginx");
        assert!(pm.install("htop", None).is_ok());
        assert!(pm.install("nginx", None).is_err());
        // The failing call is still recorded for inspection
        assert_eq!(pm.recorded().len(), 2);
    }

    #[test]
    fn test_name_validation() {
        let pm = RecordingPackageManager::default();
        assert!(pm.install("", None).is_err());
        assert!(pm.install("--force", None).is_err());

        let sm = RecordingServiceManager::default();
        assert!(sm.start(" ").is_err());
    }
}
