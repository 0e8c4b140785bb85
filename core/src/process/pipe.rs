use std::io::ErrorKind;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::process::Child;
use tokio::process::ChildStdin;
use tokio::process::Command;
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

/// How long to wait for output readers to drain after the shell exits.
/// Background jobs can keep the pipes open indefinitely.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Launches the shell with piped stdio in its own process group.
#[derive(Debug, Default)]
pub struct PipeLauncher;

impl ProcessLauncher for PipeLauncher {
    fn launch(
        &mut self,
        spec: &LaunchSpec<'_>,
        events: mpsc::UnboundedSender<ProcessEvent>,
    ) -> Result<Box<dyn ProcessHandle>, ShellError> {
        let mut command = Command::new(spec.dialect.program());
        command
            .args(spec.dialect.args())
            .current_dir(spec.cwd)
            .envs(spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(ShellError::spawn_failed)?;
        let Some(pid) = child.id() else {
            return Err(ShellError::missing_pid());
        };
        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            let _ = kill_process_tree(pid);
            return Err(ShellError::spawn_failed(std::io::Error::other(
                "shell stdio was not captured",
            )));
        };

        let (paused_tx, paused_rx) = pause_channel();
        let readers = vec![
            spawn_reader(
                pid,
                OutputStream::Stdout,
                stdout,
                paused_rx.clone(),
                events.clone(),
            ),
            spawn_reader(pid, OutputStream::Stderr, stderr, paused_rx, events.clone()),
        ];

        let (stdin_tx, stdin_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let writer = tokio::spawn(write_stdin_loop(pid, stdin, stdin_rx));

        let exited = Arc::new(AtomicBool::new(false));
        tokio::spawn(watch_exit(pid, child, readers, exited.clone(), events));

        info!(pid, program = %spec.dialect.program().display(), "spawned shell");
        Ok(Box::new(PipeProcess {
            pid,
            stdin_tx,
            paused: paused_tx,
            exited,
            writer,
        }))
    }

    fn echoes_input(&self) -> bool {
        false
    }
}

struct PipeProcess {
    pid: u32,
    stdin_tx: mpsc::UnboundedSender<Vec<u8>>,
    paused: watch::Sender<bool>,
    exited: Arc<AtomicBool>,
    writer: JoinHandle<()>,
}

impl StreamControl for PipeProcess {
    fn pause_output(&mut self) {
        debug!(pid = self.pid, "pausing shell output");
        self.paused.send_replace(true);
    }

    fn resume_output(&mut self) {
        debug!(pid = self.pid, "resuming shell output");
        self.paused.send_replace(false);
    }
}

impl ProcessHandle for PipeProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn write_stdin(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.stdin_tx
            .send(bytes.to_vec())
            .map_err(|_| std::io::Error::new(ErrorKind::BrokenPipe, "shell stdin is closed"))
    }

    fn kill_tree(&mut self) -> std::io::Result<()> {
        info!(pid = self.pid, "killing shell process tree");
        kill_process_tree(self.pid)
    }
}

impl Drop for PipeProcess {
    fn drop(&mut self) {
        if !self.exited.load(Ordering::SeqCst)
            && let Err(err) = kill_process_tree(self.pid)
        {
            warn!(pid = self.pid, "failed to kill shell on drop: {err}");
        }
        self.writer.abort();
    }
}

fn spawn_reader<R>(
    pid: u32,
    stream: OutputStream,
    mut reader: R,
    mut paused: watch::Receiver<bool>,
    events: mpsc::UnboundedSender<ProcessEvent>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut decoder = Utf8Decoder::default();
        let mut buf = vec![0u8; READ_CHUNK_SIZE];
        loop {
            let open = paused.wait_for(|paused| !*paused).await.is_ok();
            if !open {
                break;
            }
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let raw = buf[..n].to_vec();
                    let text = strip_ansi(&decoder.decode(&raw));
                    let chunk = OutputChunk {
                        pid,
                        stream,
                        raw,
                        text,
                    };
                    if events.send(ProcessEvent::Output(chunk)).is_err() {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!(pid, ?stream, "failed to read shell output: {err}");
                    break;
                }
            }
        }
    })
}

async fn write_stdin_loop(
    pid: u32,
    mut stdin: ChildStdin,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    while let Some(bytes) = rx.recv().await {
        if let Err(err) = stdin.write_all(&bytes).await {
            warn!(pid, "failed to write shell stdin: {err}");
            break;
        }
        if let Err(err) = stdin.flush().await {
            warn!(pid, "failed to flush shell stdin: {err}");
            break;
        }
    }
}

async fn watch_exit(
    pid: u32,
    mut child: Child,
    readers: Vec<JoinHandle<()>>,
    exited: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<ProcessEvent>,
) {
    let code = match child.wait().await {
        Ok(status) => status.code(),
        Err(err) => {
            warn!(pid, "failed to wait for shell: {err}");
            None
        }
    };
    exited.store(true, Ordering::SeqCst);
    for reader in readers {
        if timeout(READER_DRAIN_TIMEOUT, reader).await.is_err() {
            debug!(pid, "output stream still open after shell exit");
        }
    }
    info!(pid, ?code, "shell exited");
    let _ = events.send(ProcessEvent::Exited { pid, code });
}
