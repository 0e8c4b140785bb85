//! The command state machine. It owns the shell process, turns output events
//! into command results, and implements suspension on timeout.
//!
//! Everything here is synchronous and driven by one owner, which feeds it
//! process events, timer expiry and rendering turns in order. Results are
//! delivered through [`PendingOutput`].

use std::collections::HashMap;
use std::collections::VecDeque;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::task::Context;
use std::task::Poll;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::ShellSessionConfig;
use crate::ansi::strip_ansi;
use crate::delimiter::COMMAND_DELIMITER;
use crate::delimiter::DIRECTORY_MARKER;
use crate::delimiter::DelimiterScanner;
use crate::delimiter::Terminator;
use crate::delimiter::reported_directory;
use crate::dialect::ShellDialect;
use crate::error::ShellError;
use crate::escalator::ResumeAction;
use crate::escalator::TimeoutEscalator;
use crate::escalator::format_elapsed;
use crate::filter::OutputFilter;
use crate::flow::FlowController;
use crate::process::LaunchSpec;
use crate::process::OutputChunk;
use crate::process::ProcessEvent;
use crate::process::ProcessHandle;
use crate::process::ProcessLauncher;
use crate::script::script_path;
use crate::script::stage_script;
use crate::terminal::BufferMode;
use crate::terminal::ScreenChange;
use crate::terminal::TerminalEmulator;
use crate::terminal::TerminalNotice;
use crate::terminal::find_screen_toggles;

/// Prefix of every message this crate adds to command output.
pub const NOTICE_PREFIX: &str = "[agentsh]";

const SENTINELS: &[&str] = &[COMMAND_DELIMITER, DIRECTORY_MARKER];

/// Result of a command, resolved exactly once.
#[derive(Debug)]
pub struct PendingOutput {
    receiver: oneshot::Receiver<String>,
}

impl PendingOutput {
    /// Returns the output if the command has already been resolved.
    pub fn try_output(&mut self) -> Option<String> {
        self.receiver.try_recv().ok()
    }
}

impl Future for PendingOutput {
    type Output = Result<String, ShellError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|result| result.map_err(|_| ShellError::SessionClosed))
    }
}

pub struct CommandSession {
    dialect: Arc<dyn ShellDialect>,
    launcher: Box<dyn ProcessLauncher>,
    events: mpsc::UnboundedSender<ProcessEvent>,
    process: Option<Box<dyn ProcessHandle>>,
    spawned_before: bool,
    echoes_input: bool,

    pending: Option<oneshot::Sender<String>>,
    accumulated: String,
    current_command: Option<String>,
    issued_lines: Vec<String>,
    buffer_mode: BufferMode,
    suspended: bool,
    suspended_flag: Arc<AtomicBool>,
    queued: VecDeque<ProcessEvent>,
    last_known_cwd: String,
    started_at: Option<Instant>,

    terminal: TerminalEmulator,
    flow: FlowController,
    escalator: TimeoutEscalator,
    scanner: DelimiterScanner,

    agent_id: String,
    initial_cwd: PathBuf,
    script_dir: PathBuf,
    env: HashMap<String, String>,
    rows: u16,
    cols: u16,
}

impl std::fmt::Debug for CommandSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandSession")
            .field("pid", &self.process_id())
            .field("busy", &self.pending.is_some())
            .field("suspended", &self.suspended)
            .field("buffer_mode", &self.buffer_mode)
            .field("queued", &self.queued.len())
            .field("last_known_cwd", &self.last_known_cwd)
            .finish_non_exhaustive()
    }
}

impl CommandSession {
    /// `config` is expected to be validated.
    pub fn new(
        config: &ShellSessionConfig,
        launcher: Box<dyn ProcessLauncher>,
        events: mpsc::UnboundedSender<ProcessEvent>,
    ) -> Self {
        let dialect = config.dialect();
        let echoes_input = launcher.echoes_input() || dialect.echoes_input();
        let initial_cwd = config.initial_cwd();
        Self {
            dialect,
            launcher,
            events,
            process: None,
            spawned_before: false,
            echoes_input,
            pending: None,
            accumulated: String::new(),
            current_command: None,
            issued_lines: Vec::new(),
            buffer_mode: BufferMode::Normal,
            suspended: false,
            suspended_flag: Arc::new(AtomicBool::new(false)),
            queued: VecDeque::new(),
            last_known_cwd: initial_cwd.to_string_lossy().into_owned(),
            started_at: None,
            terminal: TerminalEmulator::new(config.terminal_rows, config.terminal_cols),
            flow: FlowController::new(config.high_watermark_bytes, config.low_watermark_bytes),
            escalator: TimeoutEscalator::new(config.default_timeout(), config.max_timeout()),
            scanner: DelimiterScanner::new(COMMAND_DELIMITER),
            agent_id: config.agent_id.clone(),
            initial_cwd,
            script_dir: config.resolved_script_dir(),
            env: config.env.clone(),
            rows: config.terminal_rows,
            cols: config.terminal_cols,
        }
    }

    pub fn dialect(&self) -> Arc<dyn ShellDialect> {
        self.dialect.clone()
    }

    /// Mirror of [`Self::is_suspended`] that other tasks can read.
    pub fn suspended_flag(&self) -> Arc<AtomicBool> {
        self.suspended_flag.clone()
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    pub fn is_busy(&self) -> bool {
        self.pending.is_some() || self.suspended
    }

    pub fn buffer_mode(&self) -> BufferMode {
        self.buffer_mode
    }

    pub fn process_id(&self) -> Option<u32> {
        self.process.as_ref().map(|process| process.pid())
    }

    pub fn current_command(&self) -> Option<&str> {
        self.current_command.as_deref()
    }

    pub fn last_known_cwd(&self) -> &str {
        &self.last_known_cwd
    }

    pub fn record_working_directory(&mut self, path: String) {
        self.last_known_cwd = path;
    }

    pub fn timeout_deadline(&self) -> Option<Instant> {
        self.escalator.deadline()
    }

    pub fn has_pending_render(&self) -> bool {
        self.terminal.has_pending()
    }

    /// Time since the current command started, if one is running.
    pub fn elapsed(&self, now: Instant) -> Option<Duration> {
        self.started_at
            .map(|started| now.saturating_duration_since(started))
    }

    /// Issues `command` and returns the future for its output. Fails with
    /// [`ShellError::SessionBusy`] while another command is outstanding or
    /// suspended, leaving all state untouched.
    pub fn execute(&mut self, command: &str, now: Instant) -> Result<PendingOutput, ShellError> {
        if self.is_busy() {
            return Err(ShellError::SessionBusy);
        }
        let command = command.trim().to_string();
        self.current_command = Some(command.clone());

        let respawned = match self.ensure_process() {
            Ok(respawned) => respawned,
            Err(err) => {
                self.current_command = None;
                return Err(err);
            }
        };

        let mut lines = Vec::new();
        if respawned {
            lines.push(self.dialect.change_directory(&self.last_known_cwd));
        }
        if command.contains('\n') {
            let path = script_path(
                &self.script_dir,
                &self.agent_id,
                &self.last_known_cwd,
                self.dialect.script_extension(),
            );
            if let Err(source) = stage_script(
                &path,
                self.dialect.as_ref(),
                &self.last_known_cwd,
                &command,
            ) {
                self.current_command = None;
                return Err(ShellError::script_staging(path, source));
            }
            debug!(path = %path.display(), "staged multi-line command");
            lines.push(self.dialect.run_script(&path));
        } else {
            lines.push(command.clone());
        }
        lines.push(self.dialect.report_directory(DIRECTORY_MARKER));
        lines.push(self.dialect.print_delimiter(COMMAND_DELIMITER));

        let payload: String = lines.iter().map(|line| format!("{line}\n")).collect();
        let write = match self.process.as_deref_mut() {
            Some(process) => process.write_stdin(payload.as_bytes()),
            None => Err(std::io::Error::other("shell process missing after spawn")),
        };
        if let Err(source) = write {
            warn!("failed to issue command: {source}");
            self.drop_process();
            self.current_command = None;
            return Err(ShellError::stdin_write(source));
        }

        // Only the command text goes into issued_lines for echo filtering;
        // the script invocation replaces it when staged.
        lines.insert(0, command);
        self.issued_lines = lines;
        self.accumulated.clear();
        self.scanner.reset();
        self.started_at = Some(now);
        self.escalator.arm(now, None);
        Ok(self.install_pending())
    }

    /// Entry point for every process event, in arrival order.
    pub fn handle_event(&mut self, event: ProcessEvent) {
        if self.suspended {
            self.flow
                .hold(event.byte_len(), self.process.as_deref_mut());
            self.queued.push_back(event);
            return;
        }
        let pid = event.pid();
        if self.process_id() != Some(pid) {
            debug!(pid, tracked = ?self.process_id(), "StaleOutputIgnored: event from untracked process");
            return;
        }
        if self.pending.is_none() {
            match event {
                ProcessEvent::Exited { code, .. } => {
                    info!(pid, ?code, "shell exited while idle");
                    self.drop_process();
                }
                ProcessEvent::Output(chunk) => {
                    debug!(pid, bytes = chunk.raw.len(), "discarding output with no command outstanding");
                }
            }
            return;
        }
        match event {
            ProcessEvent::Exited { code, .. } => self.handle_exit(code),
            ProcessEvent::Output(chunk) => self.handle_output(chunk),
        }
    }

    /// Lets the emulator catch up on up to `budget` queued bytes.
    pub fn render_pending(&mut self, budget: usize) {
        for notice in self.terminal.render(budget) {
            match notice {
                TerminalNotice::Acknowledged(bytes) => {
                    self.flow.acknowledge(bytes, self.process.as_deref_mut());
                }
                TerminalNotice::ScreenChanged(change) => self.on_screen_change(change),
            }
        }
    }

    /// Called when the timer armed by the escalator expires.
    pub fn on_timeout(&mut self, now: Instant) {
        if self.pending.is_none() {
            self.escalator.cancel();
            return;
        }
        if self.escalator.fire(now).is_none() {
            return;
        }
        self.flush_terminal();
        let mut output = self.current_output();
        self.accumulated.clear();
        let waited = self.elapsed(now).unwrap_or_default();
        info!(waited = %format_elapsed(waited), "command suspended after timeout");
        push_notice(
            &mut output,
            &format!(
                "Command is still running; interrupted after waiting {}. Reply `wait [seconds]` to keep waiting, `kill` to stop it, or any other text to send it as input.",
                format_elapsed(waited)
            ),
        );
        self.set_suspended(true);
        self.resolve(output);
    }

    /// Continues after a suspension. Queued events are replayed first; if
    /// they complete the command, `action` is skipped and the returned future
    /// is already resolved.
    pub fn resume(
        &mut self,
        action: ResumeAction,
        now: Instant,
    ) -> Result<PendingOutput, ShellError> {
        if !self.suspended {
            return self.resume_without_suspension(action, now);
        }

        if matches!(action, ResumeAction::Kill) && self.process.is_none() {
            return Err(ShellError::NoProcessToKill);
        }

        let pending = self.install_pending();
        self.set_suspended(false);
        self.escalator.resume();
        self.replay_queued();
        if self.pending.is_none() {
            return Ok(pending);
        }

        match action {
            ResumeAction::Wait(duration) => {
                let armed = self.escalator.arm(now, duration);
                debug!(duration = %format_elapsed(armed), "waiting longer for command");
            }
            ResumeAction::Kill => {
                if let Some(process) = self.process.as_deref_mut()
                    && let Err(err) = process.kill_tree()
                {
                    warn!(pid = process.pid(), "failed to kill shell process tree: {err}");
                }
                // The exit event resolves the command; the timer bounds the wait.
                self.escalator.arm(now, None);
            }
            ResumeAction::Input(text) => {
                let line = format!("{text}\n");
                if let Some(process) = self.process.as_deref_mut()
                    && let Err(err) = process.write_stdin(line.as_bytes())
                {
                    warn!(pid = process.pid(), "failed to send input to command: {err}");
                }
                self.escalator.arm(now, None);
            }
        }
        Ok(pending)
    }

    /// Asks the shell to exit, then force-resets every piece of state.
    pub fn terminate(&mut self) {
        if let Some(process) = self.process.as_deref_mut() {
            let exit = format!("{}\n", self.dialect.exit_command());
            if let Err(err) = process.write_stdin(exit.as_bytes()) {
                debug!(pid = process.pid(), "could not send exit to shell: {err}");
            }
            if let Err(err) = process.kill_tree() {
                warn!(pid = process.pid(), "failed to kill shell process tree: {err}");
            }
        }
        self.drop_process();
        self.queued.clear();
        self.set_suspended(false);
        self.reset_command_state();
        if self.pending.is_some() {
            let mut output = String::new();
            push_notice(&mut output, "Session terminated.");
            self.resolve(output);
        }
        info!("shell session terminated");
    }

    fn resume_without_suspension(
        &mut self,
        action: ResumeAction,
        now: Instant,
    ) -> Result<PendingOutput, ShellError> {
        match action {
            ResumeAction::Kill => {
                if self.pending.is_some() {
                    return Err(ShellError::SessionBusy);
                }
                let Some(process) = self.process.as_deref_mut() else {
                    return Err(ShellError::NoProcessToKill);
                };
                if let Err(err) = process.kill_tree() {
                    warn!(pid = process.pid(), "failed to kill shell process tree: {err}");
                }
                self.started_at = Some(now);
                self.escalator.arm(now, None);
                Ok(self.install_pending())
            }
            ResumeAction::Wait(_) | ResumeAction::Input(_) => {
                if self.pending.is_some() {
                    Err(ShellError::SessionBusy)
                } else {
                    Err(ShellError::NotSuspended)
                }
            }
        }
    }

    fn ensure_process(&mut self) -> Result<bool, ShellError> {
        if self.process.is_some() {
            return Ok(false);
        }
        let spec = LaunchSpec {
            dialect: self.dialect.as_ref(),
            cwd: &self.initial_cwd,
            env: &self.env,
            rows: self.rows,
            cols: self.cols,
        };
        let process = self.launcher.launch(&spec, self.events.clone())?;
        let respawned = self.spawned_before;
        self.spawned_before = true;
        self.flow.reset();
        self.process = Some(process);
        Ok(respawned)
    }

    fn drop_process(&mut self) {
        self.process = None;
        self.flow.reset();
    }

    fn handle_output(&mut self, chunk: OutputChunk) {
        let terminator = self.scanner.scan(chunk.stream, &chunk.text);
        if let Some(terminator) = &terminator
            && !terminator.carried.is_empty()
            && self.accumulated.ends_with(&terminator.carried)
        {
            let keep = self.accumulated.len() - terminator.carried.len();
            self.accumulated.truncate(keep);
        }
        let toggles = find_screen_toggles(&chunk.raw);
        if toggles.is_empty() {
            if self.buffer_mode == BufferMode::Normal {
                let end = terminator
                    .as_ref()
                    .map_or(chunk.text.len(), |terminator| terminator.cut);
                self.append_output(&chunk.text[..end]);
            }
            self.forward(&chunk.raw);
        } else {
            self.handle_screen_switches(&chunk.raw, &toggles, terminator.as_ref());
        }
        if terminator.is_some() {
            self.flush_terminal();
            self.capture_directory();
            let output = self.current_output();
            self.finish_command(output);
        }
    }

    /// Output that enters or leaves the alternate screen. The terminal is
    /// brought up to date at every switch, so each piece of text is
    /// attributed to the screen it was written on and the rendered alternate
    /// screen lands before whatever follows it.
    fn handle_screen_switches(
        &mut self,
        raw: &[u8],
        toggles: &[(usize, usize)],
        terminator: Option<&Terminator>,
    ) {
        let before = self.accumulated.len();
        let mut start = 0;
        for &(toggle_start, toggle_end) in toggles {
            self.append_normal_bytes(&raw[start..toggle_start]);
            self.forward(&raw[start..toggle_end]);
            self.flush_terminal();
            start = toggle_end;
        }
        self.append_normal_bytes(&raw[start..]);
        self.forward(&raw[start..]);

        let Some(terminator) = terminator else {
            return;
        };
        if !terminator.carried.is_empty() {
            // The delimiter completed at the very start of this chunk.
            self.accumulated.truncate(before);
        } else if let Some(index) = self.accumulated.rfind(COMMAND_DELIMITER)
            && index >= before
        {
            self.accumulated.truncate(index);
        }
    }

    fn append_normal_bytes(&mut self, bytes: &[u8]) {
        if self.buffer_mode == BufferMode::Normal && !bytes.is_empty() {
            let text = strip_ansi(&String::from_utf8_lossy(bytes));
            self.append_output(&text);
        }
    }

    fn forward(&mut self, bytes: &[u8]) {
        self.flow
            .forward(bytes, &mut self.terminal, self.process.as_deref_mut());
    }

    fn capture_directory(&mut self) {
        if let Some(path) = reported_directory(&self.accumulated) {
            debug!(path, "shell reported working directory");
            self.last_known_cwd = path.to_string();
        }
    }

    fn handle_exit(&mut self, code: Option<i32>) {
        self.flush_terminal();
        let mut output = self.current_output();
        if self.looks_like_shell_error(&output) {
            push_notice(
                &mut output,
                "The shell could not run this command: a command was not found or the input ended inside an unterminated quote or block. Check the command name and quoting.",
            );
        }
        let status = match code {
            Some(code) => format!("exit code {code}"),
            None => "terminated by signal".to_string(),
        };
        push_notice(
            &mut output,
            &format!(
                "Command killed: the shell process exited ({status}). A new shell starts with the next command."
            ),
        );
        self.drop_process();
        self.finish_command(output);
    }

    fn looks_like_shell_error(&self, output: &str) -> bool {
        output.contains(self.dialect.not_found_marker())
            || self
                .dialect
                .syntax_error_markers()
                .iter()
                .any(|marker| output.contains(marker))
    }

    fn on_screen_change(&mut self, change: ScreenChange) {
        if self.buffer_mode == BufferMode::Alternate
            && change.mode == BufferMode::Normal
            && let Some(rendered) = change.rendered_alternate
            && !rendered.is_empty()
        {
            if !self.accumulated.is_empty() && !self.accumulated.ends_with('\n') {
                self.append_output("\n");
            }
            self.append_output(&rendered);
            self.append_output("\n");
        }
        self.buffer_mode = change.mode;
    }

    fn append_output(&mut self, text: &str) {
        assert!(
            !self.suspended,
            "command output must not change while the command is suspended"
        );
        self.accumulated.push_str(text);
    }

    fn flush_terminal(&mut self) {
        self.render_pending(usize::MAX);
    }

    fn current_output(&self) -> String {
        match self.buffer_mode {
            // The sentinel is printed onto the screen like any other output.
            BufferMode::Alternate => self
                .terminal
                .alternate_text()
                .lines()
                .filter(|line| !SENTINELS.iter().any(|sentinel| line.contains(sentinel)))
                .collect::<Vec<_>>()
                .join("\n"),
            BufferMode::Normal => OutputFilter::new(
                self.dialect.as_ref(),
                self.echoes_input,
                SENTINELS,
                &self.issued_lines,
            )
            .apply(&self.accumulated),
        }
    }

    fn replay_queued(&mut self) {
        while let Some(event) = self.queued.pop_front() {
            self.flow
                .acknowledge(event.byte_len(), self.process.as_deref_mut());
            self.handle_event(event);
        }
    }

    fn install_pending(&mut self) -> PendingOutput {
        assert!(
            self.pending.is_none(),
            "only one command may be outstanding at a time"
        );
        let (sender, receiver) = oneshot::channel();
        self.pending = Some(sender);
        PendingOutput { receiver }
    }

    fn finish_command(&mut self, output: String) {
        self.reset_command_state();
        self.resolve(output);
    }

    fn reset_command_state(&mut self) {
        self.accumulated.clear();
        self.current_command = None;
        self.issued_lines.clear();
        self.escalator.cancel();
        self.scanner.reset();
        self.started_at = None;
        let dropped = self.terminal.reset();
        self.flow
            .acknowledge(dropped, self.process.as_deref_mut());
        self.buffer_mode = self.terminal.mode();
    }

    fn resolve(&mut self, output: String) {
        let Some(sender) = self.pending.take() else {
            panic!("command output resolved with no command outstanding");
        };
        if sender.send(output).is_err() {
            debug!("caller stopped waiting for command output");
        }
    }

    fn set_suspended(&mut self, suspended: bool) {
        self.suspended = suspended;
        self.suspended_flag.store(suspended, Ordering::SeqCst);
    }
}

fn push_notice(output: &mut String, message: &str) {
    if !output.is_empty() {
        output.push('\n');
    }
    output.push_str(NOTICE_PREFIX);
    output.push(' ');
    output.push_str(message);
}
