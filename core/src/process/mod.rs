//! The shell child process and the events its output streams produce.

mod pipe;
mod pty;

use std::collections::HashMap;
use std::path::Path;

use tokio::sync::mpsc;
use tokio::sync::watch;

use crate::config::Backend;
use crate::dialect::ShellDialect;
use crate::error::ShellError;

pub use pipe::PipeLauncher;
pub use pty::PtyLauncher;

const READ_CHUNK_SIZE: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputStream {
    Stdout,
    Stderr,
    /// Merged output of a pseudo-terminal.
    Pty,
}

/// One read from an output stream. `raw` is fed to the terminal emulator,
/// `text` is the same bytes decoded with escape sequences removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    pub pid: u32,
    pub stream: OutputStream,
    pub raw: Vec<u8>,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Output(OutputChunk),
    Exited { pid: u32, code: Option<i32> },
}

impl ProcessEvent {
    pub fn pid(&self) -> u32 {
        match self {
            Self::Output(chunk) => chunk.pid,
            Self::Exited { pid, .. } => *pid,
        }
    }

    pub(crate) fn byte_len(&self) -> usize {
        match self {
            Self::Output(chunk) => chunk.raw.len(),
            Self::Exited { .. } => 0,
        }
    }
}

/// Pausing and resuming the reads from a process's output streams.
pub trait StreamControl {
    fn pause_output(&mut self);

    fn resume_output(&mut self);
}

pub trait ProcessHandle: StreamControl + Send {
    fn pid(&self) -> u32;

    fn write_stdin(&mut self, bytes: &[u8]) -> std::io::Result<()>;

    /// Kills the shell together with everything it started.
    fn kill_tree(&mut self) -> std::io::Result<()>;
}

#[derive(Debug, Clone, Copy)]
pub struct LaunchSpec<'a> {
    pub dialect: &'a dyn ShellDialect,
    pub cwd: &'a Path,
    pub env: &'a HashMap<String, String>,
    pub rows: u16,
    pub cols: u16,
}

pub trait ProcessLauncher: Send {
    /// Spawns the shell. Output and exit notifications are delivered on
    /// `events`, tagged with the new process id.
    fn launch(
        &mut self,
        spec: &LaunchSpec<'_>,
        events: mpsc::UnboundedSender<ProcessEvent>,
    ) -> Result<Box<dyn ProcessHandle>, ShellError>;

    /// Whether the launched shell echoes its input and prompts.
    fn echoes_input(&self) -> bool;
}

pub fn launcher_for(backend: Backend) -> Box<dyn ProcessLauncher> {
    match backend {
        Backend::Pipe => Box::new(PipeLauncher),
        Backend::Pty => Box::new(PtyLauncher),
    }
}

/// Shared by every reader of one process; `true` means reads are paused.
fn pause_channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

#[cfg(unix)]
pub(crate) fn kill_process_tree(pid: u32) -> std::io::Result<()> {
    let pgid = libc::pid_t::try_from(pid).map_err(std::io::Error::other)?;
    // The shell leads its own process group, so signalling the group reaches
    // every descendant that did not detach.
    let result = unsafe { libc::kill(-pgid, libc::SIGKILL) };
    if result == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(());
    }
    Err(err)
}

#[cfg(windows)]
pub(crate) fn kill_process_tree(pid: u32) -> std::io::Result<()> {
    let status = std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T", "/F"])
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()?;
    if status.success() {
        Ok(())
    } else {
        Err(std::io::Error::other(format!("taskkill exited with {status}")))
    }
}

#[cfg(not(any(unix, windows)))]
pub(crate) fn kill_process_tree(_pid: u32) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "process tree kill is not supported on this platform",
    ))
}
