//! Drives the real `sandbox_kernel` binary with `sh` standing in for the
//! interpreter.
#![cfg(unix)]

use std::fs;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use sandbox::client::TcpConnector;
use sandbox::launcher::build_launcher;
use sandbox::{CodeInterpreter, FINISHED_EXECUTION, SandboxConfig, Workspace};

fn shell_config() -> SandboxConfig {
    SandboxConfig {
        kernel_bin: Some(PathBuf::from(env!("CARGO_BIN_EXE_sandbox_kernel"))),
        interpreter: "sh".to_owned(),
        interpreter_args: vec!["-s".to_owned()],
        startup_timeout: Duration::from_secs(10),
        ready_timeout: Duration::from_secs(5),
        ..SandboxConfig::default()
    }
}

fn shell_interpreter() -> (CodeInterpreter, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let workspace = Workspace::create(dir.path().join("code_interpreter_workspace")).unwrap();
    let config = shell_config();
    let launcher = build_launcher(&config).unwrap();
    let connector = Arc::new(TcpConnector::new(config.ready_timeout));
    let tool = CodeInterpreter::with_parts(workspace, launcher, connector, Duration::from_secs(10));
    (tool, dir)
}

fn leftover_descriptors(tool: &CodeInterpreter) -> Vec<String> {
    fs::read_dir(tool.workspace().path())
        .unwrap()
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| name.starts_with("kernel_"))
        .collect()
}

// =============================================================================
// Execution
// =============================================================================

#[test]
fn test_stdout_is_returned() {
    let (tool, _dir) = shell_interpreter();
    let result = tool.call(r#"{"code": "echo hello"}"#, &[], None);
    assert_eq!(result.trim(), "hello");
    assert!(leftover_descriptors(&tool).is_empty());
}

#[test]
fn test_stderr_of_failing_program_is_returned() {
    let (tool, _dir) = shell_interpreter();
    let result = tool.call("```sh\necho oops >&2\nexit 3\n```", &[], None);
    assert_eq!(result.trim(), "oops");
}

#[test]
fn test_interleaved_streams_keep_their_order() {
    let (tool, _dir) = shell_interpreter();
    let result = tool.call("echo one\necho two >&2\necho three", &[], None);
    assert_eq!(result.lines().collect::<Vec<_>>(), ["one", "two", "three"]);
}

#[test]
fn test_silent_program_reports_finished() {
    let (tool, _dir) = shell_interpreter();
    assert_eq!(tool.call("x=1", &[], None), FINISHED_EXECUTION);
}

#[test]
fn test_blank_code_is_empty() {
    let (tool, _dir) = shell_interpreter();
    assert_eq!(tool.call("", &[], None), "");
}

#[test]
fn test_kernel_runs_in_workspace() {
    let (tool, _dir) = shell_interpreter();
    let result = tool.call("pwd", &[], None);
    let expected = fs::canonicalize(tool.workspace().path()).unwrap();
    assert_eq!(PathBuf::from(result.trim()), expected);
}

#[test]
fn test_attached_files_are_exported() {
    let (tool, dir) = shell_interpreter();
    let data = dir.path().join("data.csv");
    fs::write(&data, "a,b\n1,2\n").unwrap();
    let result = tool.call(
        r#"{"code": "cat \"$SANDBOX_ATTACHED_FILES\""}"#,
        &[data],
        None,
    );
    assert_eq!(result, "a,b\n1,2\n");
}

// =============================================================================
// Timeouts and isolation
// =============================================================================

#[test]
fn test_runaway_program_times_out() {
    let (tool, _dir) = shell_interpreter();
    let start = Instant::now();
    let result = tool.call("sleep 30", &[], Some(Duration::from_millis(500)));
    assert_eq!(result, "timeout");
    assert!(start.elapsed() < Duration::from_secs(5), "took {:?}", start.elapsed());
    assert!(leftover_descriptors(&tool).is_empty());
}

#[test]
fn test_concurrent_calls_are_isolated() {
    let (tool, _dir) = shell_interpreter();
    let tool = Arc::new(tool);
    let handles: Vec<_> = (0..4)
        .map(|idx| {
            let tool = tool.clone();
            thread::spawn(move || {
                let result = tool.call(format!("n={idx}\necho \"call $n\""), &[], None);
                (idx, result)
            })
        })
        .collect();
    for handle in handles {
        let (idx, result) = handle.join().unwrap();
        assert_eq!(result.trim(), format!("call {idx}"));
    }
    assert!(leftover_descriptors(&tool).is_empty());
}

#[test]
fn test_state_does_not_leak_between_calls() {
    let (tool, _dir) = shell_interpreter();
    tool.call("export LEAK=yes", &[], None);
    let result = tool.call("echo \"leak=${LEAK:-no}\"", &[], None);
    assert_eq!(result.trim(), "leak=no");
}

// =============================================================================
// Kernel lifecycle
// =============================================================================

#[test]
fn test_kernel_exits_when_no_client_connects() {
    let dir = tempfile::tempdir().unwrap();
    let descriptor = dir.path().join("kernel_lonely.json");
    let start = Instant::now();
    let status = Command::new(env!("CARGO_BIN_EXE_sandbox_kernel"))
        .arg("--connection-file")
        .arg(&descriptor)
        .args(["--session-id", "lonely", "--interpreter", "sh"])
        .args(["--accept-timeout-secs", "1"])
        .stderr(Stdio::null())
        .status()
        .unwrap();
    assert!(!status.success());
    assert!(start.elapsed() < Duration::from_secs(10), "took {:?}", start.elapsed());
    assert!(!descriptor.exists());
}
