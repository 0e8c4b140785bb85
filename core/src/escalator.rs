use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalatorState {
    Idle,
    Armed { deadline: Instant, duration: Duration },
    Suspended { waited: Duration },
}

/// Deadline for the running command. When it passes, the command is
/// suspended and the caller decides how to continue.
#[derive(Debug)]
pub struct TimeoutEscalator {
    state: EscalatorState,
    default_timeout: Duration,
    max_timeout: Duration,
}

impl TimeoutEscalator {
    pub fn new(default_timeout: Duration, max_timeout: Duration) -> Self {
        Self {
            state: EscalatorState::Idle,
            default_timeout: default_timeout.min(max_timeout),
            max_timeout,
        }
    }

    /// Arms the deadline for `requested` (or the default), clamped to the
    /// maximum. Returns the effective duration.
    pub fn arm(&mut self, now: Instant, requested: Option<Duration>) -> Duration {
        assert!(
            !matches!(self.state, EscalatorState::Suspended { .. }),
            "a suspended command must be resumed before it is re-armed"
        );
        let duration = requested
            .unwrap_or(self.default_timeout)
            .min(self.max_timeout);
        self.state = EscalatorState::Armed {
            deadline: now + duration,
            duration,
        };
        duration
    }

    pub fn cancel(&mut self) {
        self.state = EscalatorState::Idle;
    }

    /// Moves from `Armed` to `Suspended` if the deadline has passed. Returns
    /// the armed duration when that happens.
    pub fn fire(&mut self, now: Instant) -> Option<Duration> {
        match self.state {
            EscalatorState::Armed { deadline, duration } if now >= deadline => {
                self.state = EscalatorState::Suspended { waited: duration };
                Some(duration)
            }
            _ => None,
        }
    }

    pub fn resume(&mut self) {
        if matches!(self.state, EscalatorState::Suspended { .. }) {
            self.state = EscalatorState::Idle;
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        match self.state {
            EscalatorState::Armed { deadline, .. } => Some(deadline),
            _ => None,
        }
    }

    pub fn state(&self) -> EscalatorState {
        self.state
    }
}

/// How the caller wants a suspended command to continue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeAction {
    /// Keep waiting, optionally for a specific duration.
    Wait(Option<Duration>),
    /// Kill the command together with the shell.
    Kill,
    /// Send a line of input to the running command.
    Input(String),
}

impl ResumeAction {
    /// Interprets a free-form reply: `wait`, `wait <seconds>`, `kill`, or
    /// anything else as input.
    pub fn parse(reply: &str) -> Self {
        let trimmed = reply.trim();
        let mut words = trimmed.split_whitespace();
        match (words.next(), words.next(), words.next()) {
            (Some(word), None, None) if word.eq_ignore_ascii_case("wait") => Self::Wait(None),
            (Some(word), None, None) if word.eq_ignore_ascii_case("kill") => Self::Kill,
            (Some(word), Some(seconds), None) if word.eq_ignore_ascii_case("wait") => {
                match seconds.parse::<u64>() {
                    Ok(seconds) => Self::Wait(Some(Duration::from_secs(seconds))),
                    Err(_) => Self::Input(reply.trim_end_matches(['\r', '\n']).to_string()),
                }
            }
            _ => Self::Input(reply.trim_end_matches(['\r', '\n']).to_string()),
        }
    }
}

pub fn format_elapsed(elapsed: Duration) -> String {
    if elapsed < Duration::from_secs(1) {
        return format!("{}ms", elapsed.as_millis());
    }
    let secs = elapsed.as_secs();
    if secs < 60 {
        if elapsed.subsec_millis() == 0 {
            return format!("{secs}s");
        }
        return format!("{:.1}s", elapsed.as_secs_f64());
    }
    let minutes = secs / 60;
    let seconds = secs % 60;
    if minutes < 60 {
        return format!("{minutes}m {seconds:02}s");
    }
    format!("{}h {:02}m", minutes / 60, minutes % 60)
}
