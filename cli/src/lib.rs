use std::path::PathBuf;

use agentsh_core::Backend;
use agentsh_core::ResumeAction;
use agentsh_core::ShellKind;
use agentsh_core::ShellSession;
use agentsh_core::ShellSessionConfig;
use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;

/// Runs shell commands read from stdin, one per line, through a single
/// agent shell session.
///
/// While a command is suspended after a timeout, the next line is a reply:
/// `wait [seconds]`, `kill`, or text to send to the command. `:cwd`,
/// `:elapsed` and `:exit` query or end the session.
#[derive(Debug, Parser)]
#[command(name = "agentsh", version)]
pub struct Cli {
    /// TOML session configuration.
    #[arg(long = "config", value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Shell dialect: bash, sh, zsh or powershell.
    #[arg(long = "shell", value_name = "KIND")]
    pub shell: Option<ShellKind>,

    /// Initial working directory.
    #[arg(long = "cwd", value_name = "DIR")]
    pub cwd: Option<PathBuf>,

    /// How long a command may run before it is suspended.
    #[arg(long = "timeout-ms", value_name = "MS")]
    pub timeout_ms: Option<u64>,

    /// Run the shell on a pseudo-terminal instead of pipes.
    #[arg(long = "pty", default_value_t = false)]
    pub pty: bool,
}

#[derive(Debug, PartialEq, Eq)]
enum Line {
    Skip,
    Command(String),
    Resume(ResumeAction),
    WorkingDirectory,
    Elapsed,
    Exit,
}

impl Line {
    fn parse(line: &str, suspended: bool) -> Self {
        match line.trim() {
            ":exit" => Self::Exit,
            ":cwd" => Self::WorkingDirectory,
            ":elapsed" => Self::Elapsed,
            _ if suspended => Self::Resume(ResumeAction::parse(line)),
            "" => Self::Skip,
            command => Self::Command(command.to_string()),
        }
    }
}

/// Applies command-line overrides on top of the configuration file.
pub fn build_config(cli: &Cli) -> Result<ShellSessionConfig> {
    let mut config = match &cli.config {
        Some(path) => ShellSessionConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => ShellSessionConfig::default(),
    };
    if let Some(kind) = cli.shell {
        config.shell.kind = kind;
    }
    if let Some(cwd) = &cli.cwd {
        config.cwd = Some(cwd.clone());
    }
    if let Some(timeout_ms) = cli.timeout_ms {
        config.default_timeout_ms = timeout_ms;
    }
    if cli.pty {
        config.backend = Backend::Pty;
    }
    config.validate().context("invalid session configuration")?;
    Ok(config)
}

pub async fn run(cli: Cli) -> Result<()> {
    let config = build_config(&cli)?;
    let session = ShellSession::spawn(config).context("failed to start shell session")?;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
        let reply = match Line::parse(&line, session.is_suspended()) {
            Line::Skip => continue,
            Line::Exit => break,
            Line::Command(command) => match session.execute(&command).await {
                Ok(pending) => pending.await,
                Err(err) => Err(err),
            },
            Line::Resume(action) => match session.resume(action).await {
                Ok(pending) => pending.await,
                Err(err) => Err(err),
            },
            Line::WorkingDirectory => session.current_path().await,
            Line::Elapsed => session.elapsed_display().await,
        };
        match reply {
            Ok(text) => {
                stdout.write_all(text.as_bytes()).await?;
                stdout.write_all(b"\n").await?;
                stdout.flush().await?;
            }
            Err(err) => eprintln!("error: {err}"),
        }
    }

    session
        .terminate()
        .await
        .context("failed to terminate shell session")?;
    Ok(())
}
