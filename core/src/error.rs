use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ShellError {
    #[error("a command is already running or suspended; resume it before executing another")]
    SessionBusy,
    #[error("failed to spawn shell process: {source}")]
    ProcessSpawnFailed {
        #[source]
        source: std::io::Error,
    },
    #[error("no live shell process to kill")]
    NoProcessToKill,
    #[error("no suspended command to resume")]
    NotSuspended,
    #[error("failed to write to shell stdin: {source}")]
    StdinWrite {
        #[source]
        source: std::io::Error,
    },
    #[error("failed to stage script {}: {source}", path.display())]
    ScriptStaging {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("shell session closed")]
    SessionClosed,
}

impl ShellError {
    pub(crate) fn spawn_failed(source: std::io::Error) -> Self {
        Self::ProcessSpawnFailed { source }
    }

    pub(crate) fn missing_pid() -> Self {
        Self::spawn_failed(std::io::Error::other(
            "platform did not report a process identifier",
        ))
    }

    pub(crate) fn stdin_write(source: std::io::Error) -> Self {
        Self::StdinWrite { source }
    }

    pub(crate) fn script_staging(path: PathBuf, source: std::io::Error) -> Self {
        Self::ScriptStaging { path, source }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {source}")]
    Parse {
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}
