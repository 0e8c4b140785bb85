use crate::dialect::ShellDialect;

/// Removes the shell's own noise from captured command output: prompts,
/// echoed input and anything carrying one of the sentinels.
pub(crate) struct OutputFilter<'a> {
    dialect: &'a dyn ShellDialect,
    echoes_input: bool,
    sentinels: &'a [&'a str],
    issued: Vec<&'a str>,
}

impl<'a> OutputFilter<'a> {
    /// `issued` holds every line written to stdin for the current command.
    pub(crate) fn new(
        dialect: &'a dyn ShellDialect,
        echoes_input: bool,
        sentinels: &'a [&'a str],
        issued: &'a [String],
    ) -> Self {
        let issued = issued
            .iter()
            .flat_map(|command| command.lines())
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect();
        Self {
            dialect,
            echoes_input,
            sentinels,
            issued,
        }
    }

    pub(crate) fn apply(&self, text: &str) -> String {
        let lines: Vec<&str> = text
            .lines()
            .map(|line| line.trim_end_matches('\r'))
            .collect();
        let last_content = lines.iter().rposition(|line| !line.trim().is_empty());
        let kept: Vec<&str> = lines
            .iter()
            .enumerate()
            .filter(|(index, line)| !self.is_noise(line, Some(*index) == last_content))
            .map(|(_, line)| *line)
            .collect();
        let start = kept
            .iter()
            .position(|line| !line.trim().is_empty())
            .unwrap_or(kept.len());
        let end = kept
            .iter()
            .rposition(|line| !line.trim().is_empty())
            .map_or(start, |index| index + 1);
        kept[start..end]
            .iter()
            .map(|line| line.trim_end())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// A prompt with nothing after it only counts as noise on the last line,
    /// where the shell is waiting for input.
    fn is_noise(&self, line: &str, is_last: bool) -> bool {
        if self.sentinels.iter().any(|sentinel| line.contains(sentinel)) {
            return true;
        }
        if !self.echoes_input {
            return false;
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return false;
        }
        if self.issued.contains(&trimmed) {
            return true;
        }
        match self.dialect.strip_prompt(line) {
            Some(rest) => {
                let rest = rest.trim();
                if rest.is_empty() {
                    is_last
                } else {
                    self.issued.contains(&rest)
                }
            }
            None => false,
        }
    }
}
