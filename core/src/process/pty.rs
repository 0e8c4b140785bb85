use std::io::ErrorKind;
use std::io::Read;
use std::io::Write;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use portable_pty::ChildKiller;
use portable_pty::CommandBuilder;
use portable_pty::MasterPty;
use portable_pty::PtySize;
use portable_pty::native_pty_system;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio::time::timeout;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::LaunchSpec;
use super::OutputChunk;
use super::OutputStream;
use super::ProcessEvent;
use super::ProcessHandle;
use super::ProcessLauncher;
use super::READ_CHUNK_SIZE;
use super::StreamControl;
use super::kill_process_tree;
use super::pause_channel;
use crate::ansi::Utf8Decoder;
use crate::ansi::strip_ansi;
use crate::error::ShellError;

const READER_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);
const PAUSE_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(5);

/// Launches the shell attached to a pseudo-terminal.
#[derive(Debug, Default)]
pub struct PtyLauncher;

fn pty_error(err: impl std::fmt::Display) -> ShellError {
    ShellError::spawn_failed(std::io::Error::other(err.to_string()))
}

impl ProcessLauncher for PtyLauncher {
    fn launch(
        &mut self,
        spec: &LaunchSpec<'_>,
        events: mpsc::UnboundedSender<ProcessEvent>,
    ) -> Result<Box<dyn ProcessHandle>, ShellError> {
        let pair = native_pty_system()
            .openpty(PtySize {
                rows: spec.rows,
                cols: spec.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(pty_error)?;

        let mut builder = CommandBuilder::new(spec.dialect.program());
        builder.args(spec.dialect.args());
        builder.cwd(spec.cwd);
        for (key, value) in spec.env {
            builder.env(key, value);
        }

        let mut child = pair.slave.spawn_command(builder).map_err(pty_error)?;
        // Only the child may hold the slave side, otherwise reads never see EOF.
        drop(pair.slave);
        let Some(pid) = child.process_id() else {
            let _ = child.kill();
            return Err(ShellError::missing_pid());
        };
        let killer = child.clone_killer();

        let reader = pair.master.try_clone_reader().map_err(pty_error)?;
        let writer = pair.master.take_writer().map_err(pty_error)?;

        let (paused_tx, paused_rx) = pause_channel();
        let reader_handle = spawn_reader(pid, reader, paused_rx, events.clone());

        let writer = Arc::new(StdMutex::new(writer));
        let (stdin_tx, mut stdin_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let writer_handle = tokio::spawn(async move {
            while let Some(bytes) = stdin_rx.recv().await {
                let writer = writer.clone();
                let result = tokio::task::spawn_blocking(move || {
                    let mut guard = writer
                        .lock()
                        .map_err(|_| std::io::Error::other("pty writer lock poisoned"))?;
                    guard.write_all(&bytes)?;
                    guard.flush()
                })
                .await;
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        warn!(pid, "failed to write pty input: {err}");
                        break;
                    }
                    Err(err) => {
                        warn!(pid, "pty writer task failed: {err}");
                        break;
                    }
                }
            }
        });

        let exited = Arc::new(AtomicBool::new(false));
        let wait_exited = exited.clone();
        tokio::spawn(async move {
            let code = match tokio::task::spawn_blocking(move || child.wait()).await {
                Ok(Ok(status)) => i32::try_from(status.exit_code()).ok(),
                Ok(Err(err)) => {
                    warn!(pid, "failed to wait for shell: {err}");
                    None
                }
                Err(err) => {
                    warn!(pid, "shell wait task failed: {err}");
                    None
                }
            };
            wait_exited.store(true, Ordering::SeqCst);
            if timeout(READER_DRAIN_TIMEOUT, reader_handle).await.is_err() {
                debug!(pid, "pty still open after shell exit");
            }
            info!(pid, ?code, "shell exited");
            let _ = events.send(ProcessEvent::Exited { pid, code });
        });

        info!(pid, program = %spec.dialect.program().display(), "spawned shell on pty");
        Ok(Box::new(PtyProcess {
            pid,
            stdin_tx,
            paused: paused_tx,
            exited,
            killer,
            writer: writer_handle,
            _master: pair.master,
        }))
    }

    fn echoes_input(&self) -> bool {
        true
    }
}

struct PtyProcess {
    pid: u32,
    stdin_tx: mpsc::UnboundedSender<Vec<u8>>,
    paused: watch::Sender<bool>,
    exited: Arc<AtomicBool>,
    killer: Box<dyn ChildKiller + Send + Sync>,
    writer: JoinHandle<()>,
    _master: Box<dyn MasterPty + Send>,
}

impl StreamControl for PtyProcess {
    fn pause_output(&mut self) {
        debug!(pid = self.pid, "pausing pty output");
        self.paused.send_replace(true);
    }

    fn resume_output(&mut self) {
        debug!(pid = self.pid, "resuming pty output");
        self.paused.send_replace(false);
    }
}

impl ProcessHandle for PtyProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn write_stdin(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.stdin_tx
            .send(bytes.to_vec())
            .map_err(|_| std::io::Error::new(ErrorKind::BrokenPipe, "pty input is closed"))
    }

    fn kill_tree(&mut self) -> std::io::Result<()> {
        info!(pid = self.pid, "killing shell process tree");
        match kill_process_tree(self.pid) {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!(pid = self.pid, "process group kill failed, killing shell only: {err}");
                self.killer.kill()
            }
        }
    }
}

impl Drop for PtyProcess {
    fn drop(&mut self) {
        if !self.exited.load(Ordering::SeqCst)
            && let Err(err) = self.kill_tree()
        {
            warn!(pid = self.pid, "failed to kill shell on drop: {err}");
        }
        self.writer.abort();
    }
}

fn spawn_reader(
    pid: u32,
    mut reader: Box<dyn Read + Send>,
    paused: watch::Receiver<bool>,
    events: mpsc::UnboundedSender<ProcessEvent>,
) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        let mut decoder = Utf8Decoder::default();
        let mut buf = [0u8; READ_CHUNK_SIZE];
        loop {
            while *paused.borrow() {
                if paused.has_changed().is_err() {
                    return;
                }
                std::thread::sleep(PAUSE_POLL_INTERVAL);
            }
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    let raw = buf[..n].to_vec();
                    let text = strip_ansi(&decoder.decode(&raw));
                    let chunk = OutputChunk {
                        pid,
                        stream: OutputStream::Pty,
                        raw,
                        text,
                    };
                    if events.send(ProcessEvent::Output(chunk)).is_err() {
                        break;
                    }
                }
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                    std::thread::sleep(PAUSE_POLL_INTERVAL);
                    continue;
                }
                Err(_) => break,
            }
        }
    })
}
