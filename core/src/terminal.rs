//! Virtual screen fed with the raw output bytes. It tracks whether the
//! program switched to the alternate screen and renders that screen as text.
//!
//! Writes are queued and only parsed when [`TerminalEmulator::render`] runs,
//! so rendering can lag behind the producer. Every rendered write is
//! acknowledged with its byte count so the flow controller can release
//! backpressure.

use std::collections::VecDeque;

/// Escape sequences that enter or leave the alternate screen. Writes are
/// split around them so each transition is observed on its own.
const SCREEN_TOGGLES: [&[u8]; 6] = [
    b"\x1b[?1049h",
    b"\x1b[?1049l",
    b"\x1b[?1047h",
    b"\x1b[?1047l",
    b"\x1b[?47h",
    b"\x1b[?47l",
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BufferMode {
    #[default]
    Normal,
    Alternate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScreenChange {
    pub mode: BufferMode,
    /// Final text of the alternate screen, present when leaving it.
    pub rendered_alternate: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalNotice {
    Acknowledged(usize),
    ScreenChanged(ScreenChange),
}

pub struct TerminalEmulator {
    parser: vt100::Parser,
    rows: u16,
    cols: u16,
    pending: VecDeque<Vec<u8>>,
    pending_bytes: usize,
    mode: BufferMode,
    alternate_snapshot: String,
}

impl std::fmt::Debug for TerminalEmulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminalEmulator")
            .field("rows", &self.rows)
            .field("cols", &self.cols)
            .field("pending_bytes", &self.pending_bytes)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl TerminalEmulator {
    pub fn new(rows: u16, cols: u16) -> Self {
        Self {
            parser: vt100::Parser::new(rows, cols, 0),
            rows,
            cols,
            pending: VecDeque::new(),
            pending_bytes: 0,
            mode: BufferMode::Normal,
            alternate_snapshot: String::new(),
        }
    }

    pub fn write(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        self.pending_bytes += bytes.len();
        self.pending.push_back(bytes.to_vec());
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn pending_bytes(&self) -> usize {
        self.pending_bytes
    }

    pub fn mode(&self) -> BufferMode {
        self.mode
    }

    /// Parses queued writes until at least `budget` bytes were consumed or
    /// the queue is empty. Whole writes are always processed.
    pub fn render(&mut self, budget: usize) -> Vec<TerminalNotice> {
        let mut notices = Vec::new();
        let mut processed = 0usize;
        while processed < budget {
            let Some(bytes) = self.pending.pop_front() else {
                break;
            };
            self.pending_bytes -= bytes.len();
            self.apply(&bytes, &mut notices);
            processed += bytes.len();
            notices.push(TerminalNotice::Acknowledged(bytes.len()));
        }
        notices
    }

    /// Plain-text render of the alternate screen: the live screen while it is
    /// active, otherwise the last content it showed.
    pub fn alternate_text(&self) -> String {
        if self.mode == BufferMode::Alternate {
            trim_screen(&self.parser.screen().contents())
        } else {
            trim_screen(&self.alternate_snapshot)
        }
    }

    /// Replaces the screen with a fresh normal one and drops queued writes.
    /// Returns the number of dropped bytes, which will never be acknowledged
    /// by rendering.
    pub fn reset(&mut self) -> usize {
        let dropped = self.pending_bytes;
        self.parser = vt100::Parser::new(self.rows, self.cols, 0);
        self.pending.clear();
        self.pending_bytes = 0;
        self.mode = BufferMode::Normal;
        self.alternate_snapshot.clear();
        dropped
    }

    fn apply(&mut self, bytes: &[u8], notices: &mut Vec<TerminalNotice>) {
        let mut start = 0;
        for (toggle_start, toggle_end) in find_screen_toggles(bytes) {
            self.parser.process(&bytes[start..toggle_start]);
            self.refresh_snapshot();
            self.parser.process(&bytes[toggle_start..toggle_end]);
            self.observe_mode(notices);
            start = toggle_end;
        }
        self.parser.process(&bytes[start..]);
        self.refresh_snapshot();
        self.observe_mode(notices);
    }

    fn refresh_snapshot(&mut self) {
        if self.mode == BufferMode::Alternate && self.parser.screen().alternate_screen() {
            self.alternate_snapshot = self.parser.screen().contents();
        }
    }

    fn observe_mode(&mut self, notices: &mut Vec<TerminalNotice>) {
        let mode = if self.parser.screen().alternate_screen() {
            BufferMode::Alternate
        } else {
            BufferMode::Normal
        };
        if mode == self.mode {
            return;
        }
        let rendered_alternate = match (self.mode, mode) {
            (BufferMode::Alternate, BufferMode::Normal) => {
                Some(trim_screen(&std::mem::take(&mut self.alternate_snapshot)))
            }
            _ => None,
        };
        self.mode = mode;
        notices.push(TerminalNotice::ScreenChanged(ScreenChange {
            mode,
            rendered_alternate,
        }));
    }
}

pub(crate) fn find_screen_toggles(bytes: &[u8]) -> Vec<(usize, usize)> {
    let mut found = Vec::new();
    let mut index = 0;
    while index < bytes.len() {
        if bytes[index] == 0x1b
            && let Some(toggle) = SCREEN_TOGGLES
                .iter()
                .find(|toggle| bytes[index..].starts_with(toggle))
        {
            found.push((index, index + toggle.len()));
            index += toggle.len();
            continue;
        }
        index += 1;
    }
    found
}

fn trim_screen(contents: &str) -> String {
    let lines: Vec<&str> = contents.lines().map(str::trim_end).collect();
    lines.join("\n").trim_matches('\n').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn screen_changes(notices: &[TerminalNotice]) -> Vec<ScreenChange> {
        notices
            .iter()
            .filter_map(|notice| match notice {
                TerminalNotice::ScreenChanged(change) => Some(change.clone()),
                TerminalNotice::Acknowledged(_) => None,
            })
            .collect()
    }

    fn acknowledged(notices: &[TerminalNotice]) -> usize {
        notices
            .iter()
            .map(|notice| match notice {
                TerminalNotice::Acknowledged(n) => *n,
                TerminalNotice::ScreenChanged(_) => 0,
            })
            .sum()
    }

    #[test]
    fn writes_are_queued_until_rendered() {
        let mut terminal = TerminalEmulator::new(24, 80);
        terminal.write(b"hello\r\n");
        terminal.write(b"world\r\n");
        assert_eq!(terminal.pending_bytes(), 14);

        let notices = terminal.render(usize::MAX);
        assert_eq!(acknowledged(&notices), 14);
        assert_eq!(terminal.pending_bytes(), 0);
        assert!(!terminal.has_pending());
    }

    #[test]
    fn render_budget_limits_work_per_call() {
        let mut terminal = TerminalEmulator::new(24, 80);
        terminal.write(&[b'a'; 10]);
        terminal.write(&[b'b'; 10]);
        let notices = terminal.render(5);
        assert_eq!(acknowledged(&notices), 10);
        assert_eq!(terminal.pending_bytes(), 10);
    }

    #[test]
    fn alternate_round_trip_reports_rendered_screen() {
        let mut terminal = TerminalEmulator::new(24, 80);
        terminal.write(b"before\r\n\x1b[?1049h\x1b[H  top - load 0.5   \r\nPID CMD");
        let entered = screen_changes(&terminal.render(usize::MAX));
        assert_eq!(
            entered,
            vec![ScreenChange {
                mode: BufferMode::Alternate,
                rendered_alternate: None,
            }]
        );
        assert_eq!(terminal.mode(), BufferMode::Alternate);
        assert_eq!(terminal.alternate_text(), "  top - load 0.5\nPID CMD");

        terminal.write(b"\x1b[?1049lafter\r\n");
        let left = screen_changes(&terminal.render(usize::MAX));
        assert_eq!(
            left,
            vec![ScreenChange {
                mode: BufferMode::Normal,
                rendered_alternate: Some("  top - load 0.5\nPID CMD".to_string()),
            }]
        );
    }

    #[test]
    fn enter_and_leave_in_one_write_are_both_observed() {
        let mut terminal = TerminalEmulator::new(24, 80);
        terminal.write(b"\x1b[?1049hless view\x1b[?1049l");
        let changes = screen_changes(&terminal.render(usize::MAX));
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].mode, BufferMode::Alternate);
        assert_eq!(changes[1].mode, BufferMode::Normal);
        assert_eq!(changes[1].rendered_alternate.as_deref(), Some("less view"));
    }

    #[test]
    fn reset_drops_queue_and_returns_to_normal() {
        let mut terminal = TerminalEmulator::new(24, 80);
        terminal.write(b"\x1b[?1049h");
        terminal.render(usize::MAX);
        terminal.write(b"queued");
        assert_eq!(terminal.reset(), 6);
        assert_eq!(terminal.mode(), BufferMode::Normal);
        assert!(!terminal.has_pending());
    }

    #[test]
    fn finds_every_toggle_variant() {
        let bytes = b"a\x1b[?47hb\x1b[?1047lc\x1b[?1049h";
        assert_eq!(find_screen_toggles(bytes), vec![(1, 7), (8, 16), (17, 25)]);
    }
}
