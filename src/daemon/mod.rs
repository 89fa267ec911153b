//! OS-Service Host Adapter: installs/uninstalls/starts/stops the supervisor
//! as a systemd unit, and backs a local PID-file liveness check for
//! foreground/manual runs that bypass the host's service manager.

use crate::error::{HostError, Result};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{info, warn};

pub mod signals;

const UNIT_NAME: &str = "wardend.service";

/// Host-managed lifecycle via `systemctl`: the supervisor's own process is
/// governed by the same mechanism that governs the services it supervises.
pub struct HostAdapter {
    unit_path: PathBuf,
}

impl HostAdapter {
    pub fn new() -> Self {
        Self { unit_path: PathBuf::from("/etc/systemd/system").join(UNIT_NAME) }
    }

    pub fn install(&self, binary_path: &Path, config_path: &Path) -> Result<()> {
        let unit = format!(
            "[Unit]\n\
             Description=Host service and file supervisor\n\
             After=network.target\n\
             \n\
             [Service]\n\
             Type=simple\n\
             ExecStart={bin} --config {cfg}\n\
             Restart=on-failure\n\
             \n\
             [Install]\n\
             WantedBy=multi-user.target\n",
            bin = binary_path.display(),
            cfg = config_path.display(),
        );

        fs::write(&self.unit_path, unit)?;
        run_systemctl(&["daemon-reload"])?;
        run_systemctl(&["enable", UNIT_NAME])?;
        info!(unit = %self.unit_path.display(), "installed service unit");
        Ok(())
    }

    pub fn uninstall(&self) -> Result<()> {
        run_systemctl(&["disable", UNIT_NAME])?;
        if self.unit_path.exists() {
            fs::remove_file(&self.unit_path)?;
        }
        run_systemctl(&["daemon-reload"])?;
        info!("uninstalled service unit");
        Ok(())
    }

    pub fn start(&self) -> Result<()> {
        run_systemctl(&["start", UNIT_NAME])?;
        Ok(())
    }

    pub fn stop(&self) -> Result<()> {
        run_systemctl(&["stop", UNIT_NAME])?;
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        match run_systemctl(&["is-active", UNIT_NAME]) {
            Ok(output) => String::from_utf8_lossy(&output.stdout).trim() == "active",
            Err(_) => false,
        }
    }
}

impl Default for HostAdapter {
    fn default() -> Self {
        Self::new()
    }
}

fn run_systemctl(args: &[&str]) -> Result<std::process::Output> {
    Command::new("systemctl")
        .args(args)
        .output()
        .map_err(|e| HostError::Systemctl(e.to_string()).into())
}

/// Base directory for the PID file backing a foreground/manual instance:
/// `$XDG_CONFIG_HOME/wardend` or `~/.config/wardend`.
pub fn default_runtime_dir() -> Result<PathBuf> {
    let base = if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(xdg)
    } else {
        dirs::home_dir().ok_or(HostError::HomeDirUnknown)?.join(".config")
    };
    Ok(base.join("wardend"))
}

/// PID-file-backed liveness check for a foreground instance, used by
/// `status` and to guard against double-starts outside the host's service
/// manager. Mirrors the fork/detach lifecycle pattern used elsewhere in
/// this codebase, minus the fork itself: `--foreground` runs attached.
pub struct PidGuard {
    pid_file: PathBuf,
}

impl PidGuard {
    pub fn new(runtime_dir: &Path) -> Result<Self> {
        fs::create_dir_all(runtime_dir)?;
        Ok(Self { pid_file: runtime_dir.join("wardend.pid") })
    }

    pub fn pid_path(&self) -> &Path {
        &self.pid_file
    }

    pub fn is_running(&self) -> bool {
        let Ok(pid_str) = fs::read_to_string(&self.pid_file) else { return false };
        let Ok(pid) = pid_str.trim().parse::<i32>() else {
            let _ = fs::remove_file(&self.pid_file);
            return false;
        };

        match signal::kill(Pid::from_raw(pid), None) {
            Ok(()) => true,
            Err(_) => {
                warn!("stale pid file detected, cleaning up");
                let _ = fs::remove_file(&self.pid_file);
                false
            },
        }
    }

    /// Claim the PID file for the current process. Fails if another process
    /// is already alive and holding it.
    pub fn claim(&self) -> Result<()> {
        if self.is_running() {
            let pid = fs::read_to_string(&self.pid_file).ok().and_then(|s| s.trim().parse().ok()).unwrap_or(0);
            return Err(HostError::AlreadyRunning(pid).into());
        }
        fs::write(&self.pid_file, std::process::id().to_string())?;
        Ok(())
    }

    pub fn release(&self) {
        let _ = fs::remove_file(&self.pid_file);
    }

    /// Send SIGTERM to the pid in the file, then escalate to SIGKILL after
    /// the process fails to exit within ~3 seconds.
    pub fn stop(&self) -> Result<()> {
        let pid_str = fs::read_to_string(&self.pid_file).map_err(|_| HostError::NotRunning)?;
        let pid = pid_str.trim().parse::<i32>().map_err(|_| HostError::NotRunning)?;

        info!(pid, "sending SIGTERM");
        signal::kill(Pid::from_raw(pid), Signal::SIGTERM).map_err(|_| HostError::NotRunning)?;

        for i in 0..30 {
            std::thread::sleep(std::time::Duration::from_millis(100));
            if signal::kill(Pid::from_raw(pid), None).is_err() {
                let _ = fs::remove_file(&self.pid_file);
                return Ok(());
            }
            if i == 29 {
                warn!("process did not respond to SIGTERM in time, escalating");
            }
        }

        let _ = signal::kill(Pid::from_raw(pid), Signal::SIGKILL);
        std::thread::sleep(std::time::Duration::from_millis(500));
        let _ = fs::remove_file(&self.pid_file);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_guard_not_running_without_file() {
        let dir = tempfile::tempdir().unwrap();
        let guard = PidGuard::new(dir.path()).unwrap();
        assert!(!guard.is_running());
    }

    #[test]
    fn pid_guard_claim_writes_current_pid() {
        let dir = tempfile::tempdir().unwrap();
        let guard = PidGuard::new(dir.path()).unwrap();
        guard.claim().unwrap();
        let contents = fs::read_to_string(guard.pid_path()).unwrap();
        assert_eq!(contents, std::process::id().to_string());
        guard.release();
    }

    #[test]
    fn pid_guard_claim_fails_while_running() {
        let dir = tempfile::tempdir().unwrap();
        let guard = PidGuard::new(dir.path()).unwrap();
        guard.claim().unwrap();
        assert!(guard.claim().is_err());
        guard.release();
    }
}
