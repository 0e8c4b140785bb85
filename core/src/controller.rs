//! Async front end for [`CommandSession`]. One actor task owns the session
//! and serialises caller requests, process events, timer expiry and terminal
//! rendering; callers talk to it through [`ShellSession`].

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;
use tracing::info;

use crate::config::ShellSessionConfig;
use crate::dialect::ShellDialect;
use crate::error::ConfigError;
use crate::error::ShellError;
use crate::escalator::ResumeAction;
use crate::escalator::format_elapsed;
use crate::process::ProcessEvent;
use crate::process::ProcessLauncher;
use crate::process::launcher_for;
use crate::session::CommandSession;
use crate::session::NOTICE_PREFIX;
use crate::session::PendingOutput;

/// Bytes of terminal output parsed per idle turn of the actor. Requests and
/// process events are handled between turns.
const RENDER_BUDGET_BYTES: usize = 16 * 1024;

type Reply<T> = oneshot::Sender<T>;

enum Request {
    Execute {
        command: String,
        reply: Reply<Result<PendingOutput, ShellError>>,
    },
    Resume {
        action: ResumeAction,
        reply: Reply<Result<PendingOutput, ShellError>>,
    },
    Elapsed {
        reply: Reply<Option<Duration>>,
    },
    WorkingDirectory {
        reply: Reply<String>,
    },
    RecordWorkingDirectory {
        path: String,
    },
    Terminate {
        reply: Reply<()>,
    },
}

/// Handle to a shell session. Clones share the same shell; the shell is
/// terminated once every handle is dropped.
#[derive(Clone)]
pub struct ShellSession {
    requests: mpsc::UnboundedSender<Request>,
    suspended: Arc<AtomicBool>,
    dialect: Arc<dyn ShellDialect>,
}

impl std::fmt::Debug for ShellSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShellSession")
            .field("suspended", &self.is_suspended())
            .finish_non_exhaustive()
    }
}

impl ShellSession {
    /// Validates `config` and starts the session actor. The shell itself is
    /// spawned lazily by the first command. Must be called from within a
    /// tokio runtime.
    pub fn spawn(config: ShellSessionConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let launcher = launcher_for(config.backend);
        Ok(Self::with_launcher(&config, launcher))
    }

    pub fn with_launcher(config: &ShellSessionConfig, launcher: Box<dyn ProcessLauncher>) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let session = CommandSession::new(config, launcher, event_tx);
        let suspended = session.suspended_flag();
        let dialect = session.dialect();
        tokio::spawn(run_actor(session, request_rx, event_rx));
        Self {
            requests: request_tx,
            suspended,
            dialect,
        }
    }

    /// Issues `command`. Fails immediately with [`ShellError::SessionBusy`]
    /// when a command is outstanding or suspended; otherwise returns the
    /// future for its output.
    pub async fn execute(&self, command: &str) -> Result<PendingOutput, ShellError> {
        let command = command.to_string();
        self.request(|reply| Request::Execute { command, reply })
            .await?
    }

    /// Continues a suspended command.
    pub async fn resume(&self, action: ResumeAction) -> Result<PendingOutput, ShellError> {
        self.request(|reply| Request::Resume { action, reply })
            .await?
    }

    /// Executes `command` and waits for its output.
    pub async fn run(&self, command: &str) -> Result<String, ShellError> {
        self.execute(command).await?.await
    }

    /// The shell's working directory. Asks the shell when it is idle and
    /// falls back to the last known directory otherwise.
    pub async fn current_path(&self) -> Result<String, ShellError> {
        if self.is_suspended() {
            return self.cached_path().await;
        }
        let pending = match self.execute(self.dialect.print_working_directory()).await {
            Ok(pending) => pending,
            Err(ShellError::SessionBusy) => return self.cached_path().await,
            Err(err) => return Err(err),
        };
        let output = pending.await?;
        if output.contains(NOTICE_PREFIX) {
            return self.cached_path().await;
        }
        let Some(path) = output
            .lines()
            .map(str::trim)
            .rfind(|line| !line.is_empty())
        else {
            return self.cached_path().await;
        };
        let path = path.to_string();
        self.send(Request::RecordWorkingDirectory { path: path.clone() })?;
        Ok(path)
    }

    /// Time since the current command started, or `None` when idle.
    pub async fn elapsed(&self) -> Result<Option<Duration>, ShellError> {
        self.request(|reply| Request::Elapsed { reply }).await
    }

    /// [`Self::elapsed`] formatted for people; empty when idle.
    pub async fn elapsed_display(&self) -> Result<String, ShellError> {
        Ok(self
            .elapsed()
            .await?
            .map(format_elapsed)
            .unwrap_or_default())
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }

    /// Stops the shell and resets the session. An outstanding command
    /// resolves with a termination notice.
    pub async fn terminate(&self) -> Result<(), ShellError> {
        self.request(|reply| Request::Terminate { reply }).await
    }

    async fn cached_path(&self) -> Result<String, ShellError> {
        self.request(|reply| Request::WorkingDirectory { reply })
            .await
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Request) -> Result<T, ShellError> {
        let (reply, response) = oneshot::channel();
        self.send(build(reply))?;
        response.await.map_err(|_| ShellError::SessionClosed)
    }

    fn send(&self, request: Request) -> Result<(), ShellError> {
        self.requests
            .send(request)
            .map_err(|_| ShellError::SessionClosed)
    }
}

async fn run_actor(
    mut session: CommandSession,
    mut requests: mpsc::UnboundedReceiver<Request>,
    mut events: mpsc::UnboundedReceiver<ProcessEvent>,
) {
    loop {
        let deadline = session.timeout_deadline();
        let render_ready = session.has_pending_render();
        tokio::select! {
            biased;
            request = requests.recv() => {
                let Some(request) = request else {
                    debug!("all session handles dropped");
                    break;
                };
                handle_request(&mut session, request);
            }
            Some(event) = events.recv() => session.handle_event(event),
            () = sleep_until_deadline(deadline) => session.on_timeout(Instant::now()),
            () = std::future::ready(()), if render_ready => {
                session.render_pending(RENDER_BUDGET_BYTES);
            }
        }
    }
    session.terminate();
    info!("shell session actor stopped");
}

fn handle_request(session: &mut CommandSession, request: Request) {
    match request {
        Request::Execute { command, reply } => {
            let _ = reply.send(session.execute(&command, Instant::now()));
        }
        Request::Resume { action, reply } => {
            let _ = reply.send(session.resume(action, Instant::now()));
        }
        Request::Elapsed { reply } => {
            let _ = reply.send(session.elapsed(Instant::now()));
        }
        Request::WorkingDirectory { reply } => {
            let _ = reply.send(session.last_known_cwd().to_string());
        }
        Request::RecordWorkingDirectory { path } => session.record_working_directory(path),
        Request::Terminate { reply } => {
            session.terminate();
            let _ = reply.send(());
        }
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
