mod common;
use common::{test_settings, FakeShell, RecordingEcho, Script};

use std::sync::Arc;
use swarmlink::errors::ErrorKind;
use swarmlink::services::command::{CommandExecutor, EchoMode};
use swarmlink::services::echo::EchoLine;

fn executor() -> (CommandExecutor, Arc<FakeShell>, Arc<RecordingEcho>) {
    let shell = FakeShell::new(&test_settings());
    let echo = Arc::new(RecordingEcho::default());
    let executor = CommandExecutor::new(shell.clone(), echo.clone(), "i-123@prod");
    (executor, shell, echo)
}

#[test]
fn execute_echoes_command_and_tagged_lines() {
    let (executor, shell, echo) = executor();
    shell.script(
        "docker node ls",
        vec![Script::output("ID HOSTNAME\nabc m1\n", "warning: old\n", 0)],
    );

    let status = executor
        .execute("docker node ls", EchoMode::ALL)
        .expect("execute");
    assert_eq!(status, 0);

    let lines = echo.lines();
    assert_eq!(
        lines[0],
        EchoLine::Command {
            prompt: "i-123@prod".to_string(),
            command: "docker node ls".to_string(),
        }
    );
    let stdout: Vec<&EchoLine> = lines
        .iter()
        .filter(|line| matches!(line, EchoLine::Stdout(_)))
        .collect();
    assert_eq!(
        stdout,
        vec![
            &EchoLine::Stdout("ID HOSTNAME".to_string()),
            &EchoLine::Stdout("abc m1".to_string()),
        ]
    );
    assert!(lines.contains(&EchoLine::Stderr("warning: old".to_string())));
}

#[test]
fn execute_returns_remote_status_and_flushes_partial_lines() {
    let (executor, shell, echo) = executor();
    shell.script("false", vec![Script::output("no newline", "", 3)]);

    assert_eq!(executor.execute("false", true).expect("execute"), 3);
    assert_eq!(
        echo.lines().last(),
        Some(&EchoLine::Stdout("no newline".to_string()))
    );
}

#[test]
fn silent_mode_emits_nothing() {
    let (executor, shell, echo) = executor();
    shell.script("uptime", vec![Script::output("up 3 days\n", "", 0)]);

    assert_eq!(executor.execute("uptime", false).expect("execute"), 0);
    assert!(echo.lines().is_empty());
    assert_eq!(shell.executed(), vec!["uptime".to_string()]);
}

#[test]
fn partial_echo_modes_filter_streams() {
    let (executor, shell, echo) = executor();
    shell.script("mixed", vec![Script::output("out\n", "err\n", 0)]);

    let mode = EchoMode {
        command: false,
        stdout: false,
        stderr: true,
    };
    executor.execute("mixed", mode).expect("execute");
    assert_eq!(echo.lines(), vec![EchoLine::Stderr("err".to_string())]);
}

#[test]
fn disconnect_mid_command_is_an_execution_error() {
    let (executor, shell, _) = executor();
    shell.script(
        "tail -f log",
        vec![Script {
            stdout: b"first\n".to_vec(),
            disconnect: true,
            ..Script::default()
        }],
    );

    let err = executor
        .execute("tail -f log", EchoMode::NONE)
        .expect_err("disconnect");
    assert_eq!(err.kind(), ErrorKind::Execution);
    assert!(err.to_string().contains("tail -f log"), "{}", err);
}

#[test]
fn capture_collects_output_without_echoing() {
    let (executor, shell, echo) = executor();
    shell.script(
        "docker config rm app.env",
        vec![Script::output("", "Error: no such config: app.env\n", 1)],
    );

    let output = executor
        .capture("docker config rm app.env")
        .expect("capture");
    assert!(!output.success());
    assert_eq!(output.status, 1);
    assert!(output.stdout.is_empty());
    assert_eq!(output.stderr_text(), "Error: no such config: app.env");
    assert!(echo.lines().is_empty());
}
