use tracing::debug;

use crate::process::StreamControl;
use crate::terminal::TerminalEmulator;

/// Byte-count backpressure between the process output streams and the
/// terminal emulator, with hysteresis between the two watermarks.
#[derive(Debug)]
pub struct FlowController {
    unacknowledged: usize,
    high_watermark: usize,
    low_watermark: usize,
    paused: bool,
}

impl FlowController {
    pub fn new(high_watermark: usize, low_watermark: usize) -> Self {
        assert!(
            low_watermark < high_watermark,
            "low watermark must be below the high watermark"
        );
        Self {
            unacknowledged: 0,
            high_watermark,
            low_watermark,
            paused: false,
        }
    }

    /// Hands `bytes` to the emulator and pauses the streams once the
    /// unacknowledged total exceeds the high watermark.
    pub fn forward<S>(
        &mut self,
        bytes: &[u8],
        terminal: &mut TerminalEmulator,
        streams: Option<&mut S>,
    ) where
        S: StreamControl + ?Sized,
    {
        terminal.write(bytes);
        self.hold(bytes.len(), streams);
    }

    /// Counts bytes that are buffered elsewhere and not yet rendered.
    pub fn hold<S>(&mut self, bytes: usize, streams: Option<&mut S>)
    where
        S: StreamControl + ?Sized,
    {
        self.unacknowledged += bytes;
        if !self.paused && self.unacknowledged > self.high_watermark {
            debug!(
                unacknowledged = self.unacknowledged,
                "output above high watermark"
            );
            self.paused = true;
            if let Some(streams) = streams {
                streams.pause_output();
            }
        }
    }

    pub fn acknowledge<S>(&mut self, bytes: usize, streams: Option<&mut S>)
    where
        S: StreamControl + ?Sized,
    {
        self.unacknowledged = self.unacknowledged.saturating_sub(bytes);
        if self.paused && self.unacknowledged < self.low_watermark {
            debug!(
                unacknowledged = self.unacknowledged,
                "output below low watermark"
            );
            self.paused = false;
            if let Some(streams) = streams {
                streams.resume_output();
            }
        }
    }

    pub fn unacknowledged(&self) -> usize {
        self.unacknowledged
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Forgets all counted bytes, e.g. when the process they came from is gone.
    pub fn reset(&mut self) {
        self.unacknowledged = 0;
        self.paused = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[derive(Debug, Default)]
    struct RecordingStreams {
        pauses: usize,
        resumes: usize,
    }

    impl StreamControl for RecordingStreams {
        fn pause_output(&mut self) {
            self.pauses += 1;
        }

        fn resume_output(&mut self) {
            self.resumes += 1;
        }
    }

    #[test]
    fn pauses_above_high_and_resumes_below_low() {
        let mut flow = FlowController::new(100_000, 10_000);
        let mut terminal = TerminalEmulator::new(24, 80);
        let mut streams = RecordingStreams::default();

        flow.forward(&vec![b'x'; 100_000], &mut terminal, Some(&mut streams));
        assert!(!flow.is_paused());
        flow.forward(b"x", &mut terminal, Some(&mut streams));
        assert!(flow.is_paused());
        assert_eq!(streams.pauses, 1);
        assert_eq!(flow.unacknowledged(), 100_001);

        flow.acknowledge(90_000, Some(&mut streams));
        assert_eq!(flow.unacknowledged(), 10_001);
        assert!(flow.is_paused());
        assert_eq!(streams.resumes, 0);

        flow.acknowledge(2, Some(&mut streams));
        assert_eq!(flow.unacknowledged(), 9_999);
        assert!(!flow.is_paused());
        assert_eq!(streams.resumes, 1);
    }

    #[test]
    fn counter_never_goes_negative() {
        let mut flow = FlowController::new(10, 5);
        flow.acknowledge::<RecordingStreams>(3, None);
        assert_eq!(flow.unacknowledged(), 0);
    }

    #[test]
    fn pause_is_signalled_once() {
        let mut flow = FlowController::new(10, 5);
        let mut streams = RecordingStreams::default();
        flow.hold(11, Some(&mut streams));
        flow.hold(20, Some(&mut streams));
        assert_eq!(streams.pauses, 1);
    }

    #[test]
    fn forwarded_bytes_reach_the_terminal() {
        let mut flow = FlowController::new(10, 5);
        let mut terminal = TerminalEmulator::new(24, 80);
        flow.forward::<RecordingStreams>(b"abc", &mut terminal, None);
        assert_eq!(terminal.pending_bytes(), 3);
    }
}
