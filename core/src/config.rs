use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dirs::cache_dir;
use serde::Deserialize;

use crate::dialect::ShellDialect;
use crate::dialect::ShellKind;
use crate::error::ConfigError;

pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const MAX_TIMEOUT_MS: u64 = 600_000;
pub const DEFAULT_HIGH_WATERMARK_BYTES: usize = 100_000;
pub const DEFAULT_LOW_WATERMARK_BYTES: usize = 10_000;
const DEFAULT_TERMINAL_ROWS: u16 = 24;
const DEFAULT_TERMINAL_COLS: u16 = 80;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Plain pipes: separate stdout/stderr, no terminal attached.
    #[default]
    Pipe,
    /// Pseudo-terminal: merged output, the shell sees a tty.
    Pty,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ShellConfig {
    pub kind: ShellKind,
    pub program: Option<PathBuf>,
    pub args: Option<Vec<String>>,
}

/// Settings for one agent's shell session. Every field has a default so an
/// empty TOML document is a valid configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ShellSessionConfig {
    pub agent_id: String,
    pub cwd: Option<PathBuf>,
    pub shell: ShellConfig,
    pub backend: Backend,
    pub default_timeout_ms: u64,
    pub max_timeout_ms: u64,
    pub high_watermark_bytes: usize,
    pub low_watermark_bytes: usize,
    pub terminal_rows: u16,
    pub terminal_cols: u16,
    pub script_dir: Option<PathBuf>,
    pub env: HashMap<String, String>,
}

impl Default for ShellSessionConfig {
    fn default() -> Self {
        Self {
            agent_id: "agent".to_string(),
            cwd: None,
            shell: ShellConfig::default(),
            backend: Backend::default(),
            default_timeout_ms: DEFAULT_TIMEOUT_MS,
            max_timeout_ms: MAX_TIMEOUT_MS,
            high_watermark_bytes: DEFAULT_HIGH_WATERMARK_BYTES,
            low_watermark_bytes: DEFAULT_LOW_WATERMARK_BYTES,
            terminal_rows: DEFAULT_TERMINAL_ROWS,
            terminal_cols: DEFAULT_TERMINAL_COLS,
            script_dir: None,
            env: HashMap::new(),
        }
    }
}

impl ShellSessionConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(contents).map_err(|source| ConfigError::Parse { source })?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.low_watermark_bytes == 0 || self.high_watermark_bytes == 0 {
            return Err(ConfigError::Invalid(
                "watermarks must be greater than zero".to_string(),
            ));
        }
        if self.low_watermark_bytes >= self.high_watermark_bytes {
            return Err(ConfigError::Invalid(format!(
                "low watermark ({}) must be below high watermark ({})",
                self.low_watermark_bytes, self.high_watermark_bytes
            )));
        }
        if self.default_timeout_ms > self.max_timeout_ms {
            return Err(ConfigError::Invalid(format!(
                "default timeout ({}ms) exceeds maximum ({}ms)",
                self.default_timeout_ms, self.max_timeout_ms
            )));
        }
        if self.terminal_rows == 0 || self.terminal_cols == 0 {
            return Err(ConfigError::Invalid(
                "terminal size must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn dialect(&self) -> Arc<dyn ShellDialect> {
        self.shell
            .kind
            .dialect(self.shell.program.clone(), self.shell.args.clone())
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn max_timeout(&self) -> Duration {
        Duration::from_millis(self.max_timeout_ms)
    }

    pub fn resolved_script_dir(&self) -> PathBuf {
        match &self.script_dir {
            Some(dir) => dir.clone(),
            None => cache_dir()
                .map(|p| p.join("agentsh").join("scripts"))
                .unwrap_or_else(|| std::env::temp_dir().join("agentsh-scripts")),
        }
    }

    pub fn initial_cwd(&self) -> PathBuf {
        match &self.cwd {
            Some(cwd) => cwd.clone(),
            None => std::env::current_dir().unwrap_or_else(|_| std::env::temp_dir()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    #[test]
    fn empty_document_uses_defaults() {
        let config = match ShellSessionConfig::from_toml_str("") {
            Ok(config) => config,
            Err(err) => panic!("empty config rejected: {err}"),
        };
        assert_eq!(config, ShellSessionConfig::default());
        assert_eq!(config.default_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn parses_overrides() {
        let config = match ShellSessionConfig::from_toml_str(
            r#"
agent_id = "builder"
backend = "pty"
default_timeout_ms = 5000
high_watermark_bytes = 2048
low_watermark_bytes = 512
script_dir = "/tmp/agentsh-test"

[shell]
kind = "sh"
args = ["-i"]

[env]
LANG = "C"
"#,
        ) {
            Ok(config) => config,
            Err(err) => panic!("config rejected: {err}"),
        };
        assert_eq!(config.agent_id, "builder");
        assert_eq!(config.backend, Backend::Pty);
        assert_eq!(config.shell.kind, ShellKind::Sh);
        assert_eq!(config.shell.args, Some(vec!["-i".to_string()]));
        assert_eq!(config.env.get("LANG").map(String::as_str), Some("C"));
        assert_eq!(
            config.resolved_script_dir(),
            PathBuf::from("/tmp/agentsh-test")
        );
    }

    #[test]
    fn rejects_inverted_watermarks() {
        let result = ShellSessionConfig::from_toml_str(
            "high_watermark_bytes = 10\nlow_watermark_bytes = 10\n",
        );
        assert_matches!(result, Err(ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_default_timeout_above_maximum() {
        let result =
            ShellSessionConfig::from_toml_str("default_timeout_ms = 10\nmax_timeout_ms = 5\n");
        assert_matches!(result, Err(ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_malformed_toml() {
        let result = ShellSessionConfig::from_toml_str("agent_id = ");
        assert_matches!(result, Err(ConfigError::Parse { .. }));
    }
}
