//! Multi-line commands are written to a script file and run with a single
//! invocation, so the shell never sees a half-typed block.

use std::fmt::Write as _;
use std::path::Path;
use std::path::PathBuf;

use sha2::Digest;
use sha2::Sha256;

use crate::dialect::ShellDialect;

/// `<dir>/<agent>-<hash of cwd>.<ext>`. The same agent in the same directory
/// reuses one file.
pub(crate) fn script_path(dir: &Path, agent_id: &str, cwd: &str, extension: &str) -> PathBuf {
    let digest = Sha256::digest(cwd.as_bytes());
    let mut hash = String::with_capacity(8);
    for byte in &digest[..4] {
        let _ = write!(&mut hash, "{byte:02x}");
    }
    let agent: String = agent_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    dir.join(format!("{agent}-{hash}.{extension}"))
}

pub(crate) fn script_contents(dialect: &dyn ShellDialect, cwd: &str, command: &str) -> String {
    format!(
        "{}\n{}\n{}\n{}\n",
        dialect.script_header(),
        dialect.stop_on_error(),
        dialect.change_directory(cwd),
        command
    )
}

pub(crate) fn stage_script(
    path: &Path,
    dialect: &dyn ShellDialect,
    cwd: &str,
    command: &str,
) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, script_contents(dialect, cwd, command))
}
