//! In-memory shell used to drive the session without spawning processes.

use std::sync::Arc;
use std::sync::Mutex;

use tokio::sync::mpsc;

use crate::delimiter::COMMAND_DELIMITER;
use crate::delimiter::DIRECTORY_MARKER;
use crate::error::ShellError;
use crate::process::LaunchSpec;
use crate::process::OutputChunk;
use crate::process::OutputStream;
use crate::process::ProcessEvent;
use crate::process::ProcessHandle;
use crate::process::ProcessLauncher;
use crate::process::StreamControl;

/// What the fake shell does with one line of input.
pub(crate) enum FakeReply {
    /// Print this text and move on to the next line.
    Output(String),
    /// Block: this line and every later line of the same write produce
    /// nothing.
    Hang,
}

type Responder = Box<dyn Fn(&str) -> FakeReply + Send>;

#[derive(Default)]
pub(crate) struct FakeShellState {
    pub(crate) writes: Vec<String>,
    pub(crate) spawns: usize,
    pub(crate) kills: usize,
    pub(crate) pauses: usize,
    pub(crate) resumes: usize,
    pub(crate) paused: bool,
    pub(crate) fail_spawn: bool,
    pub(crate) live_pid: Option<u32>,
    /// Directory the fake shell is in; set at launch and by `cd` lines.
    pub(crate) cwd: String,
    next_pid: u32,
    events: Option<mpsc::UnboundedSender<ProcessEvent>>,
    responder: Option<Responder>,
}

/// Handle shared between a test and the launcher it hands to the session.
#[derive(Clone, Default)]
pub(crate) struct FakeShell {
    state: Arc<Mutex<FakeShellState>>,
}

impl FakeShell {
    /// A fake whose lines print nothing and only the delimiter print
    /// command produces output.
    pub(crate) fn silent() -> Self {
        Self::default()
    }

    pub(crate) fn with_responder(responder: impl Fn(&str) -> FakeReply + Send + 'static) -> Self {
        let shell = Self::default();
        shell.state().responder = Some(Box::new(responder));
        shell
    }

    pub(crate) fn launcher(&self) -> Box<dyn ProcessLauncher> {
        Box::new(FakeLauncher {
            state: self.state.clone(),
        })
    }

    pub(crate) fn state(&self) -> std::sync::MutexGuard<'_, FakeShellState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub(crate) fn pid(&self) -> u32 {
        match self.state().live_pid {
            Some(pid) => pid,
            None => panic!("fake shell has no live process"),
        }
    }

    pub(crate) fn writes(&self) -> Vec<String> {
        self.state().writes.clone()
    }

    pub(crate) fn emit(&self, event: ProcessEvent) {
        let state = self.state();
        if let Some(events) = &state.events {
            let _ = events.send(event);
        }
    }

    pub(crate) fn emit_stdout(&self, text: &str) {
        let pid = self.pid();
        self.emit(stdout_event(pid, text));
    }

    pub(crate) fn emit_delimiter(&self) {
        self.emit_stdout(&format!("{COMMAND_DELIMITER}\n"));
    }

    pub(crate) fn emit_exit(&self, code: Option<i32>) {
        let pid = self.pid();
        self.emit(ProcessEvent::Exited { pid, code });
    }
}

pub(crate) fn stdout_event(pid: u32, text: &str) -> ProcessEvent {
    raw_event(pid, text.as_bytes(), text)
}

pub(crate) fn raw_event(pid: u32, raw: &[u8], text: &str) -> ProcessEvent {
    ProcessEvent::Output(OutputChunk {
        pid,
        stream: OutputStream::Stdout,
        raw: raw.to_vec(),
        text: text.to_string(),
    })
}

struct FakeLauncher {
    state: Arc<Mutex<FakeShellState>>,
}

impl ProcessLauncher for FakeLauncher {
    fn launch(
        &mut self,
        spec: &LaunchSpec<'_>,
        events: mpsc::UnboundedSender<ProcessEvent>,
    ) -> Result<Box<dyn ProcessHandle>, ShellError> {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if state.fail_spawn {
            return Err(ShellError::missing_pid());
        }
        state.next_pid += 1;
        let pid = 1000 + state.next_pid;
        state.spawns += 1;
        state.live_pid = Some(pid);
        state.cwd = spec.cwd.display().to_string();
        state.events = Some(events);
        Ok(Box::new(FakeProcess {
            pid,
            state: self.state.clone(),
        }))
    }

    fn echoes_input(&self) -> bool {
        false
    }
}

struct FakeProcess {
    pid: u32,
    state: Arc<Mutex<FakeShellState>>,
}

impl FakeProcess {
    fn state(&self) -> std::sync::MutexGuard<'_, FakeShellState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl StreamControl for FakeProcess {
    fn pause_output(&mut self) {
        let mut state = self.state();
        state.pauses += 1;
        state.paused = true;
    }

    fn resume_output(&mut self) {
        let mut state = self.state();
        state.resumes += 1;
        state.paused = false;
    }
}

impl ProcessHandle for FakeProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn write_stdin(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        let pid = self.pid;
        let mut state = self.state();
        let text = String::from_utf8_lossy(bytes).into_owned();
        state.writes.push(text.clone());
        let delimiter_line = format!("echo \"{COMMAND_DELIMITER}\"");
        let directory_line = format!("echo \"{DIRECTORY_MARKER}$PWD\"");
        let mut replies = Vec::new();
        for line in text.lines() {
            if line == delimiter_line {
                replies.push(format!("{COMMAND_DELIMITER}\n"));
                continue;
            }
            if line == directory_line {
                replies.push(format!("{DIRECTORY_MARKER}{}\n", state.cwd));
                continue;
            }
            if let Some(path) = line.strip_prefix("cd ") {
                state.cwd = path.trim_matches('\'').to_string();
            }
            match state.responder.as_ref().map(|respond| respond(line)) {
                Some(FakeReply::Hang) => break,
                Some(FakeReply::Output(output)) => replies.push(output),
                None => {}
            }
        }
        if let Some(events) = &state.events {
            for reply in replies {
                let _ = events.send(stdout_event(pid, &reply));
            }
        }
        Ok(())
    }

    fn kill_tree(&mut self) -> std::io::Result<()> {
        let pid = self.pid;
        let mut state = self.state();
        state.kills += 1;
        state.live_pid = None;
        if let Some(events) = &state.events {
            let _ = events.send(ProcessEvent::Exited { pid, code: None });
        }
        Ok(())
    }
}
