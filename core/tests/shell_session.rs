#![cfg(unix)]

use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use agentsh_core::Backend;
use agentsh_core::ResumeAction;
use agentsh_core::ShellError;
use agentsh_core::ShellKind;
use agentsh_core::ShellSession;
use agentsh_core::ShellSessionConfig;
use pretty_assertions::assert_eq;
use tempfile::TempDir;

const TEST_SHELL: &str = "/bin/bash";

fn base_config(workdir: &TempDir) -> ShellSessionConfig {
    let mut config = ShellSessionConfig {
        cwd: Some(workdir.path().to_path_buf()),
        script_dir: Some(workdir.path().join("scripts")),
        ..ShellSessionConfig::default()
    };
    config.shell.kind = ShellKind::Bash;
    config.shell.program = Some(PathBuf::from(TEST_SHELL));
    config
}

fn start(config: ShellSessionConfig) -> ShellSession {
    ShellSession::spawn(config).expect("valid config")
}

async fn within<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(20), future)
        .await
        .expect("shell did not answer in time")
}

async fn run(session: &ShellSession, command: &str) -> String {
    within(session.run(command))
        .await
        .unwrap_or_else(|err| panic!("`{command}` failed: {err}"))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn echo_returns_plain_output() {
    let workdir = TempDir::new().expect("tempdir");
    let session = start(base_config(&workdir));
    assert_eq!(run(&session, "echo hello").await, "hello");
    assert_eq!(run(&session, "printf 'a\\nb\\n'").await, "a\nb");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn directory_changes_persist_between_commands() {
    let workdir = TempDir::new().expect("tempdir");
    std::fs::create_dir(workdir.path().join("nested")).expect("mkdir");
    let session = start(base_config(&workdir));

    run(&session, "cd nested").await;
    let path = within(session.current_path())
        .await
        .expect("current path");
    assert!(path.ends_with("/nested"), "{path}");
    assert_eq!(run(&session, "basename \"$PWD\"").await, "nested");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scripts_start_in_the_directory_left_by_a_plain_cd() {
    let workdir = TempDir::new().expect("tempdir");
    std::fs::create_dir(workdir.path().join("nested")).expect("mkdir");
    let session = start(base_config(&workdir));

    run(&session, "cd nested").await;
    let output = run(&session, "pwd\ntrue").await;
    assert!(output.ends_with("/nested"), "{output}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn lines_ending_in_prompt_characters_are_kept() {
    let workdir = TempDir::new().expect("tempdir");
    let config = ShellSessionConfig {
        backend: Backend::Pty,
        ..base_config(&workdir)
    };
    let session = start(config);
    let output = run(
        &session,
        "printf 'Download complete 100%%\\nTotal cost: 5$\\ndone\\n'",
    )
    .await;
    assert!(output.contains("Download complete 100%"), "{output}");
    assert!(output.contains("Total cost: 5$"), "{output}");
    assert!(output.contains("done"), "{output}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn multi_line_commands_run_as_one_script() {
    let workdir = TempDir::new().expect("tempdir");
    let session = start(base_config(&workdir));
    let output = run(&session, "for i in 1 2 3; do\n  echo line $i\ndone").await;
    assert_eq!(output, "line 1\nline 2\nline 3");

    let stopped = run(&session, "false\necho unreachable").await;
    assert!(!stopped.contains("unreachable"), "{stopped}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slow_command_is_suspended_then_waited_for() {
    let workdir = TempDir::new().expect("tempdir");
    let config = ShellSessionConfig {
        default_timeout_ms: 300,
        ..base_config(&workdir)
    };
    let session = start(config);

    let first = run(&session, "sleep 1; echo finished").await;
    assert!(first.contains("interrupted after waiting"), "{first}");
    assert!(session.is_suspended());
    assert!(matches!(
        within(session.execute("echo nope")).await,
        Err(ShellError::SessionBusy)
    ));

    let pending = within(session.resume(ResumeAction::Wait(Some(Duration::from_secs(10)))))
        .await
        .expect("resume");
    let rest = within(pending).await.expect("output");
    assert_eq!(rest, "finished");
    assert!(!session.is_suspended());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn kill_stops_the_command_and_the_next_command_respawns() {
    let workdir = TempDir::new().expect("tempdir");
    let config = ShellSessionConfig {
        default_timeout_ms: 300,
        ..base_config(&workdir)
    };
    let session = start(config);

    let first = run(&session, "sleep 30").await;
    assert!(first.contains("interrupted after waiting"), "{first}");

    let pending = within(session.resume(ResumeAction::Kill))
        .await
        .expect("kill");
    let killed = within(pending).await.expect("output");
    assert!(killed.contains("Command killed"), "{killed}");

    assert_eq!(run(&session, "echo back").await, "back");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shell_exit_is_reported_and_recovered() {
    let workdir = TempDir::new().expect("tempdir");
    let session = start(base_config(&workdir));
    let output = run(&session, "exit 3").await;
    assert!(output.contains("exit code 3"), "{output}");
    assert_eq!(run(&session, "echo again").await, "again");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pty_backend_filters_prompts_and_echo() {
    let workdir = TempDir::new().expect("tempdir");
    let config = ShellSessionConfig {
        backend: Backend::Pty,
        ..base_config(&workdir)
    };
    let session = start(config);
    for word in ["pty-ok", "again"] {
        let output = run(&session, &format!("echo {word}")).await;
        assert!(output.lines().any(|line| line == word), "{output}");
        assert!(
            !output.lines().any(|line| line.contains("echo") || line.contains("__AGENTSH")),
            "{output}"
        );
    }
}
