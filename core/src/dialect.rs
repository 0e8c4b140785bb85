//! Platform-specific details of driving an interactive shell: which binary to
//! launch, how to change directory, how to print the completion delimiter and
//! how to recognise the shell's own noise in captured output.

use std::borrow::Cow;
use std::fmt;
use std::path::Path;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::LazyLock;

use regex_lite::Regex;
use serde::Deserialize;

/// Matches prompts such as `bash-5.2$ `, `user@host:~/src$ ` or `root# `: one
/// word ending in the prompt character, followed by a space or the end of the
/// line.
static POSIX_PROMPT: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[\w.@:~/\[\]()-]*[A-Za-z][\w.@:~/\[\]()-]*[$#%](?: |$)").ok());

static POWERSHELL_PROMPT: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^PS [^>]*> ?").ok());

pub trait ShellDialect: fmt::Debug + Send + Sync {
    fn program(&self) -> &Path;

    fn args(&self) -> &[String];

    /// Command that moves the shell into `dir`.
    fn change_directory(&self, dir: &str) -> String;

    /// Command that prints `delimiter` on its own. The delimiter must appear
    /// inside double quotes so an echoed copy of the command is never mistaken
    /// for the printed value.
    fn print_delimiter(&self, delimiter: &str) -> String;

    fn print_working_directory(&self) -> &'static str;

    /// Command that prints `marker` immediately followed by the current
    /// directory. Like the delimiter, the marker sits right after a quote.
    fn report_directory(&self, marker: &str) -> String;

    /// Substring the shell prints when a command name cannot be resolved.
    fn not_found_marker(&self) -> &'static str;

    /// Substrings the shell prints when input ended inside an unterminated
    /// construct (open quote, heredoc, block).
    fn syntax_error_markers(&self) -> &'static [&'static str];

    fn exit_command(&self) -> &'static str {
        "exit"
    }

    fn script_header(&self) -> &'static str;

    fn stop_on_error(&self) -> &'static str;

    fn script_extension(&self) -> &'static str;

    fn run_script(&self, path: &Path) -> String;

    /// Whether the shell echoes prompts and input back on its output stream
    /// even when it is not attached to a terminal.
    fn echoes_input(&self) -> bool {
        false
    }

    /// Returns the remainder of `line` after a leading prompt, if it starts
    /// with one.
    fn strip_prompt<'a>(&self, line: &'a str) -> Option<&'a str>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShellKind {
    Bash,
    Sh,
    Zsh,
    #[serde(alias = "pwsh")]
    PowerShell,
}

impl Default for ShellKind {
    fn default() -> Self {
        if cfg!(windows) {
            Self::PowerShell
        } else {
            Self::Bash
        }
    }
}

impl FromStr for ShellKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "bash" => Ok(Self::Bash),
            "sh" => Ok(Self::Sh),
            "zsh" => Ok(Self::Zsh),
            "powershell" | "pwsh" => Ok(Self::PowerShell),
            other => Err(format!("unsupported shell `{other}`")),
        }
    }
}

impl ShellKind {
    /// Builds the dialect for this kind, honouring optional overrides of the
    /// binary and its arguments.
    pub fn dialect(
        self,
        program: Option<PathBuf>,
        args: Option<Vec<String>>,
    ) -> Arc<dyn ShellDialect> {
        match self {
            Self::PowerShell => Arc::new(PowerShell {
                program: program.unwrap_or_else(|| PathBuf::from(POWERSHELL_PROGRAM)),
                args: args.unwrap_or_else(PowerShell::default_args),
            }),
            kind => {
                let (default_program, default_args): (&str, &[&str]) = match kind {
                    Self::Sh => ("sh", &[]),
                    Self::Zsh => ("zsh", &["-f"]),
                    _ => ("bash", &["--noprofile", "--norc"]),
                };
                Arc::new(PosixShell {
                    kind,
                    program: program.unwrap_or_else(|| PathBuf::from(default_program)),
                    args: args.unwrap_or_else(|| {
                        default_args.iter().map(|arg| (*arg).to_string()).collect()
                    }),
                })
            }
        }
    }
}

fn single_quote(value: &str) -> String {
    shlex::try_quote(value)
        .map(Cow::into_owned)
        .unwrap_or_else(|_| format!("'{}'", value.replace('\'', r"'\''")))
}

#[derive(Debug, Clone)]
pub struct PosixShell {
    kind: ShellKind,
    program: PathBuf,
    args: Vec<String>,
}

impl ShellDialect for PosixShell {
    fn program(&self) -> &Path {
        &self.program
    }

    fn args(&self) -> &[String] {
        &self.args
    }

    fn change_directory(&self, dir: &str) -> String {
        format!("cd {}", single_quote(dir))
    }

    fn print_delimiter(&self, delimiter: &str) -> String {
        format!("echo \"{delimiter}\"")
    }

    fn print_working_directory(&self) -> &'static str {
        "pwd"
    }

    fn report_directory(&self, marker: &str) -> String {
        format!("echo \"{marker}$PWD\"")
    }

    fn not_found_marker(&self) -> &'static str {
        "command not found"
    }

    fn syntax_error_markers(&self) -> &'static [&'static str] {
        &["unexpected EOF", "unexpected end of file", "parse error"]
    }

    fn script_header(&self) -> &'static str {
        match self.kind {
            ShellKind::Sh => "#!/bin/sh",
            ShellKind::Zsh => "#!/usr/bin/env zsh",
            _ => "#!/usr/bin/env bash",
        }
    }

    fn stop_on_error(&self) -> &'static str {
        "set -e"
    }

    fn script_extension(&self) -> &'static str {
        "sh"
    }

    fn run_script(&self, path: &Path) -> String {
        format!(
            "{} {}",
            single_quote(&self.program.to_string_lossy()),
            single_quote(&path.to_string_lossy())
        )
    }

    fn strip_prompt<'a>(&self, line: &'a str) -> Option<&'a str> {
        let regex = POSIX_PROMPT.as_ref()?;
        let found = regex.find(line)?;
        Some(&line[found.end()..])
    }
}

#[derive(Debug, Clone)]
pub struct PowerShell {
    program: PathBuf,
    args: Vec<String>,
}

const POWERSHELL_PROGRAM: &str = if cfg!(windows) {
    "powershell.exe"
} else {
    "pwsh"
};

impl PowerShell {
    fn default_args() -> Vec<String> {
        ["-NoLogo", "-NoProfile", "-Command", "-"]
            .iter()
            .map(|arg| (*arg).to_string())
            .collect()
    }

    fn literal(value: &str) -> String {
        format!("'{}'", value.replace('\'', "''"))
    }
}

impl ShellDialect for PowerShell {
    fn program(&self) -> &Path {
        &self.program
    }

    fn args(&self) -> &[String] {
        &self.args
    }

    fn change_directory(&self, dir: &str) -> String {
        format!("Set-Location -LiteralPath {}", Self::literal(dir))
    }

    fn print_delimiter(&self, delimiter: &str) -> String {
        format!("Write-Output \"{delimiter}\"")
    }

    fn print_working_directory(&self) -> &'static str {
        "(Get-Location).Path"
    }

    fn report_directory(&self, marker: &str) -> String {
        format!("Write-Output \"{marker}$((Get-Location).Path)\"")
    }

    fn not_found_marker(&self) -> &'static str {
        "is not recognized as"
    }

    fn syntax_error_markers(&self) -> &'static [&'static str] {
        &["is missing the terminator", "Missing closing"]
    }

    fn script_header(&self) -> &'static str {
        "# staged by agentsh"
    }

    fn stop_on_error(&self) -> &'static str {
        "$ErrorActionPreference = 'Stop'"
    }

    fn script_extension(&self) -> &'static str {
        "ps1"
    }

    fn run_script(&self, path: &Path) -> String {
        format!("& {}", Self::literal(&path.to_string_lossy()))
    }

    fn echoes_input(&self) -> bool {
        true
    }

    fn strip_prompt<'a>(&self, line: &'a str) -> Option<&'a str> {
        let regex = POWERSHELL_PROMPT.as_ref()?;
        let found = regex.find(line)?;
        Some(&line[found.end()..])
    }
}
