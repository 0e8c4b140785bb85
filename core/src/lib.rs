//! Drives an interactive shell on behalf of an agent: one command at a time,
//! completion detected with a printed sentinel, long-running commands
//! suspended on timeout and resumed on request.

mod ansi;
mod config;
mod controller;
mod delimiter;
mod dialect;
mod error;
mod escalator;
mod filter;
mod flow;
pub mod process;
mod script;
mod session;
mod terminal;
#[cfg(test)]
mod test_support;

pub use config::Backend;
pub use config::DEFAULT_HIGH_WATERMARK_BYTES;
pub use config::DEFAULT_LOW_WATERMARK_BYTES;
pub use config::DEFAULT_TIMEOUT_MS;
pub use config::MAX_TIMEOUT_MS;
pub use config::ShellConfig;
pub use config::ShellSessionConfig;
pub use controller::ShellSession;
pub use delimiter::COMMAND_DELIMITER;
pub use dialect::PosixShell;
pub use dialect::PowerShell;
pub use dialect::ShellDialect;
pub use dialect::ShellKind;
pub use error::ConfigError;
pub use error::ShellError;
pub use escalator::EscalatorState;
pub use escalator::ResumeAction;
pub use escalator::TimeoutEscalator;
pub use escalator::format_elapsed;
pub use flow::FlowController;
pub use session::CommandSession;
pub use session::NOTICE_PREFIX;
pub use session::PendingOutput;
pub use terminal::BufferMode;
pub use terminal::ScreenChange;
pub use terminal::TerminalEmulator;
pub use terminal::TerminalNotice;
