#![cfg(unix)]

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn agentsh(workdir: &TempDir) -> Result<Command, Box<dyn std::error::Error>> {
    let mut cmd = Command::cargo_bin("agentsh")?;
    cmd.arg("--shell")
        .arg("bash")
        .arg("--cwd")
        .arg(workdir.path())
        .env("XDG_CACHE_HOME", workdir.path().join("cache"))
        .timeout(std::time::Duration::from_secs(30));
    Ok(cmd)
}

#[test]
fn commands_from_stdin_print_their_output() -> Result<(), Box<dyn std::error::Error>> {
    let workdir = TempDir::new()?;
    std::fs::create_dir(workdir.path().join("inner"))?;

    agentsh(&workdir)?
        .write_stdin("echo hello\ncd inner\n:cwd\n:exit\necho never\n")
        .assert()
        .success()
        .stdout(predicate::str::contains("hello"))
        .stdout(predicate::str::contains("/inner"))
        .stdout(predicate::str::contains("never").not());

    Ok(())
}

#[test]
fn suspended_command_accepts_wait_reply() -> Result<(), Box<dyn std::error::Error>> {
    let workdir = TempDir::new()?;

    agentsh(&workdir)?
        .arg("--timeout-ms")
        .arg("200")
        .write_stdin("sleep 1; echo late\nwait 10\n")
        .assert()
        .success()
        .stdout(predicate::str::contains("interrupted after waiting"))
        .stdout(predicate::str::contains("late"));

    Ok(())
}

#[test]
fn invalid_config_file_is_reported() -> Result<(), Box<dyn std::error::Error>> {
    let workdir = TempDir::new()?;
    let config = workdir.path().join("agentsh.toml");
    std::fs::write(&config, "low_watermark_bytes = 500\nhigh_watermark_bytes = 100\n")?;

    Command::cargo_bin("agentsh")?
        .arg("--config")
        .arg(&config)
        .write_stdin("")
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to load config"));

    Ok(())
}
