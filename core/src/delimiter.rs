//! Completion detection. After every command the shell is asked to print a
//! sentinel string; seeing it in the output means the command finished.

use std::collections::HashMap;

use crate::process::OutputStream;

pub const COMMAND_DELIMITER: &str = "__AGENTSH_COMMAND_DONE_7f3a91c2__";

/// Printed right before the delimiter, followed by the shell's working
/// directory.
pub const DIRECTORY_MARKER: &str = "__AGENTSH_CWD_7f3a91c2__";

/// Position of the sentinel relative to the chunk that completed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Terminator {
    /// Byte offset in the chunk text where the command output ends.
    pub(crate) cut: usize,
    /// Beginning of the sentinel that arrived with the previous chunk on the
    /// same stream and was already appended to the output.
    pub(crate) carried: String,
}

/// Finds the sentinel in a sequence of output chunks, including when a
/// single read splits it.
#[derive(Debug)]
pub(crate) struct DelimiterScanner {
    delimiter: &'static str,
    tails: HashMap<OutputStream, String>,
}

impl DelimiterScanner {
    pub(crate) fn new(delimiter: &'static str) -> Self {
        Self {
            delimiter,
            tails: HashMap::new(),
        }
    }

    pub(crate) fn scan(&mut self, stream: OutputStream, text: &str) -> Option<Terminator> {
        let tail = self.tails.remove(&stream).unwrap_or_default();
        let window = format!("{tail}{text}");
        // An occurrence lying entirely in the carried tail was already
        // judged with the previous chunk.
        let found = find_last_delimiter(&window, self.delimiter)
            .filter(|index| index + self.delimiter.len() > tail.len());
        // The tail is as long as the delimiter so the character in front of
        // a split occurrence is still there to be checked.
        self.tails
            .insert(stream, keep_suffix(&window, self.delimiter.len()));
        let index = found?;
        if index >= tail.len() {
            Some(Terminator {
                cut: index - tail.len(),
                carried: String::new(),
            })
        } else {
            Some(Terminator {
                cut: 0,
                carried: tail[index..].to_string(),
            })
        }
    }

    pub(crate) fn reset(&mut self) {
        self.tails.clear();
    }
}

/// Offset of the last occurrence of `delimiter` in `text`, unless that
/// occurrence directly follows a quote. A quoted occurrence is the echoed
/// print command, not the printed value; earlier occurrences are never
/// considered.
pub(crate) fn find_last_delimiter(text: &str, delimiter: &str) -> Option<usize> {
    let index = text.rfind(delimiter)?;
    match text[..index].chars().next_back() {
        Some('"' | '\'') => None,
        _ => Some(index),
    }
}

/// Directory reported by the last unquoted [`DIRECTORY_MARKER`] line.
pub(crate) fn reported_directory(text: &str) -> Option<&str> {
    text.lines().rev().find_map(|line| {
        let index = line.rfind(DIRECTORY_MARKER)?;
        if matches!(line[..index].chars().next_back(), Some('"' | '\'')) {
            return None;
        }
        let path = line[index + DIRECTORY_MARKER.len()..].trim();
        (!path.is_empty()).then_some(path)
    })
}

/// At least the last `min_bytes` of `text`, widened to a char boundary.
fn keep_suffix(text: &str, min_bytes: usize) -> String {
    let mut start = text.len().saturating_sub(min_bytes);
    while !text.is_char_boundary(start) {
        start -= 1;
    }
    text[start..].to_string()
}
