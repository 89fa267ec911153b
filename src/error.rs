//! Crate-wide error types.
//!
//! Each subsystem owns a narrow error enum for its own fallible operations;
//! this module aggregates them behind a single [`Error`] for call sites (CLI
//! dispatch, `main`) that need one return type.

use std::path::PathBuf;
use thiserror::Error as ThisError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(ThisError, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("notifier error: {0}")]
    Notify(#[from] NotifyError),

    #[error("file watch error: {0}")]
    Watch(#[from] WatchError),

    #[error("supervision error: {0}")]
    Supervise(#[from] SuperviseError),

    #[error("host adapter error: {0}")]
    Host(#[from] HostError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(ThisError, Debug)]
pub enum ConfigError {
    #[error("failed to parse ini file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: ini::Error,
    },

    #[error("io error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(ThisError, Debug)]
pub enum NotifyError {
    #[error("smtp transport error: {0}")]
    Transport(String),

    #[error("failed to build message: {0}")]
    Message(String),
}

#[derive(ThisError, Debug)]
pub enum WatchError {
    #[error("failed to create filesystem watcher: {0}")]
    Init(String),

    #[error("failed to subscribe to {path}: {source}")]
    Subscribe {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },
}

#[derive(ThisError, Debug)]
pub enum SuperviseError {
    #[error("failed to query service {name}: {reason}")]
    Query { name: String, reason: String },

    #[error("failed to start service {name}: {reason}")]
    Start { name: String, reason: String },

    #[error("failed to enumerate host services: {0}")]
    Enumerate(String),
}

#[derive(ThisError, Debug)]
pub enum HostError {
    #[error("systemctl invocation failed: {0}")]
    Systemctl(String),

    #[error("no running instance found")]
    NotRunning,

    #[error("an instance is already running (pid {0})")]
    AlreadyRunning(i32),

    #[error("cannot determine a home directory for the runtime PID file")]
    HomeDirUnknown,
}
