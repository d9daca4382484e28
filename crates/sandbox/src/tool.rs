use std::any::Any;
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, error};
use uuid::Uuid;

use crate::client::TcpConnector;
use crate::config::SandboxConfig;
use crate::error::{Result, SandboxError};
use crate::extract::{code_field, extract_code};
use crate::launcher::build_launcher;
use crate::session::{ExecutionRequest, ExecutionSession};
use crate::workspace::Workspace;
use crate::{ChannelConnector, KernelLauncher};

pub const TOOL_NAME: &str = "code_interpreter";
pub const TOOL_DESCRIPTION: &str = "Execute Python code and return the output.";
pub const FINISHED_EXECUTION: &str = "Finished execution.";

/// Raw tool-call parameters as an agent produced them.
#[derive(Clone, Debug)]
pub enum ToolInput {
    Text(String),
    Json(Value),
}

impl From<String> for ToolInput {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for ToolInput {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl From<Value> for ToolInput {
    fn from(value: Value) -> Self {
        match value {
            Value::String(text) => Self::Text(text),
            other => Self::Json(other),
        }
    }
}

impl ToolInput {
    /// Structured `{"code": ...}` first; otherwise a fenced block or the
    /// whole text. Text is read as JSON5, so single quotes, bare keys and
    /// trailing commas still count as structured.
    pub fn into_code(self) -> String {
        match self {
            ToolInput::Json(value) => code_field(&value).unwrap_or_else(|err| {
                debug!(error = %err, "falling back to code extraction");
                extract_code(&value.to_string())
            }),
            ToolInput::Text(text) => match json5::from_str::<Value>(&text) {
                Ok(Value::String(inner)) => extract_code(&inner),
                Ok(value) => code_field(&value).unwrap_or_else(|err| {
                    debug!(error = %err, "falling back to code extraction");
                    extract_code(&text)
                }),
                Err(_) => extract_code(&text),
            },
        }
    }
}

/// The `code_interpreter` tool. Every call runs in its own kernel and always
/// yields a string.
pub struct CodeInterpreter {
    session: ExecutionSession,
    default_timeout: Duration,
}

impl CodeInterpreter {
    pub fn new(config: &SandboxConfig) -> Result<Self> {
        let workspace = Workspace::in_current_dir()?;
        let launcher = build_launcher(config)?;
        let connector = Arc::new(TcpConnector::new(config.ready_timeout));
        Ok(Self::with_parts(
            workspace,
            launcher,
            connector,
            config.execution_timeout,
        ))
    }

    pub fn with_parts(
        workspace: Workspace,
        launcher: Arc<dyn KernelLauncher>,
        connector: Arc<dyn ChannelConnector>,
        default_timeout: Duration,
    ) -> Self {
        let instance_id = Uuid::new_v4().to_string();
        debug!(%instance_id, workspace = %workspace.path().display(), "code interpreter created");
        Self {
            session: ExecutionSession::new(instance_id, workspace, launcher, connector),
            default_timeout,
        }
    }

    pub fn instance_id(&self) -> &str {
        self.session.instance_id()
    }

    pub fn workspace(&self) -> &Workspace {
        self.session.workspace()
    }

    pub fn call(
        &self,
        params: impl Into<ToolInput>,
        files: &[PathBuf],
        timeout: Option<Duration>,
    ) -> String {
        let input = params.into();
        match panic::catch_unwind(AssertUnwindSafe(|| self.call_inner(input, files, timeout))) {
            Ok(text) => text,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(%message, "code interpreter panicked");
                format!("code interpreter failed: {message}")
            }
        }
    }

    fn call_inner(&self, input: ToolInput, files: &[PathBuf], timeout: Option<Duration>) -> String {
        let code = input.into_code();
        if code.trim().is_empty() {
            return String::new();
        }
        let files = match resolve_attached_files(files) {
            Ok(files) => files,
            Err(err) => return err.to_string(),
        };
        let request = ExecutionRequest::new(code)
            .with_timeout(timeout.unwrap_or(self.default_timeout))
            .with_files(files);
        self.session.run(&request).into_text()
    }
}

fn resolve_attached_files(files: &[PathBuf]) -> Result<Vec<PathBuf>> {
    files
        .iter()
        .map(|path| {
            fs::canonicalize(path).map_err(|err| {
                SandboxError::MalformedParams(format!(
                    "attached file {} is not readable: {err}",
                    path.display()
                ))
            })
        })
        .collect()
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_owned()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use serde_json::json;

    use super::*;
    use crate::protocol::ExecutionState;
    use crate::testing::{Probe, Script, mock_parts, status, stdout};

    fn interpreter_with(script: Script) -> (Probe, CodeInterpreter, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let workspace = Workspace::create(dir.path().join("code_interpreter_workspace")).unwrap();
        let (probe, launcher, connector) = mock_parts(script);
        let tool =
            CodeInterpreter::with_parts(workspace, launcher, connector, Duration::from_secs(5));
        (probe, tool, dir)
    }

    #[test]
    fn test_structured_params() {
        let (probe, tool, _dir) = interpreter_with(Script::Echo);
        let result = tool.call(r#"{"code": "print(1+1)"}"#, &[], None);
        assert_eq!(result, "print(1+1)");
        assert_eq!(probe.sent(), vec!["print(1+1)".to_owned()]);
    }

    #[test]
    fn test_json_value_params() {
        let (probe, tool, _dir) = interpreter_with(Script::Echo);
        tool.call(json!({"code": "a = 2"}), &[], None);
        assert_eq!(probe.sent(), vec!["a = 2".to_owned()]);
    }

    #[test]
    fn test_fenced_text_feeds_only_the_block() {
        let (probe, tool, _dir) = interpreter_with(Script::Echo);
        tool.call("Here:\n```\nx = 1\n```", &[], None);
        assert_eq!(probe.sent(), vec!["x = 1".to_owned()]);
    }

    #[test]
    fn test_json_without_code_field_falls_back_to_text() {
        let (probe, tool, _dir) = interpreter_with(Script::Echo);
        tool.call(r#"{"script": "print(3)"}"#, &[], None);
        assert_eq!(probe.sent(), vec![r#"{"script": "print(3)"}"#.to_owned()]);
    }

    #[test]
    fn test_single_quoted_params_are_structured() {
        let (probe, tool, _dir) = interpreter_with(Script::Echo);
        let result = tool.call("{'code': 'print(1)'}", &[], None);
        assert_eq!(result, "print(1)");
        assert_eq!(probe.sent(), vec!["print(1)".to_owned()]);
    }

    #[test]
    fn test_relaxed_params_with_trailing_comma() {
        let (probe, tool, _dir) = interpreter_with(Script::Echo);
        tool.call("{code: 'x = 1',}", &[], None);
        assert_eq!(probe.sent(), vec!["x = 1".to_owned()]);
    }

    #[test]
    fn test_json_string_is_unwrapped() {
        let (probe, tool, _dir) = interpreter_with(Script::Echo);
        tool.call(r#""print(4)""#, &[], None);
        assert_eq!(probe.sent(), vec!["print(4)".to_owned()]);
    }

    #[test]
    fn test_empty_output_maps_to_sentinel() {
        let (_probe, tool, _dir) =
            interpreter_with(Script::Reply(vec![status(ExecutionState::Idle)]));
        assert_eq!(tool.call(r#"{"code": "x = 1"}"#, &[], None), FINISHED_EXECUTION);
    }

    #[test]
    fn test_blank_code_returns_empty_string() {
        let (probe, tool, _dir) = interpreter_with(Script::Echo);
        assert_eq!(tool.call(r#"{"code": "   "}"#, &[], None), "");
        assert_eq!(probe.spawns(), 0);
    }

    #[test]
    fn test_timeout_maps_to_timeout_text() {
        let (probe, tool, _dir) = interpreter_with(Script::Hang);
        let result = tool.call("while True: pass", &[], Some(Duration::from_millis(100)));
        assert_eq!(result, "timeout");
        assert_eq!(probe.terminations(), 1);
    }

    #[test]
    fn test_missing_attached_file_is_reported() {
        let (probe, tool, dir) = interpreter_with(Script::Echo);
        let missing = dir.path().join("nope.csv");
        let result = tool.call("print(1)", &[missing], None);
        assert!(result.starts_with("malformed tool parameters"), "{result}");
        assert_eq!(probe.spawns(), 0);
    }

    #[test]
    fn test_blank_code_skips_attached_file_checks() {
        let (probe, tool, dir) = interpreter_with(Script::Echo);
        let missing = dir.path().join("nope.csv");
        assert_eq!(tool.call("", &[missing], None), "");
        assert_eq!(probe.spawns(), 0);
    }

    #[test]
    fn test_unbounded_timeout_runs_and_terminates() {
        let (probe, tool, _dir) = interpreter_with(Script::Echo);
        assert_eq!(tool.call("print(1)", &[], Some(Duration::MAX)), "print(1)");
        assert_eq!(probe.terminations(), 1);
    }

    #[test]
    fn test_panic_becomes_text() {
        let (_probe, tool, _dir) = interpreter_with(Script::Panic);
        let result = tool.call("print(1)", &[], None);
        assert_eq!(result, "code interpreter failed: launcher exploded");
    }

    #[test]
    fn test_spawn_failure_does_not_affect_concurrent_call() {
        let (probe, tool, _dir) = interpreter_with(Script::FailFirstSpawn);
        let tool = Arc::new(tool);
        let handles: Vec<_> = ["print('a')", "print('b')"]
            .into_iter()
            .map(|code| {
                let tool = tool.clone();
                thread::spawn(move || (code, tool.call(code, &[], None)))
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let failed: Vec<_> = results
            .iter()
            .filter(|(_, result)| result.starts_with("failed to spawn kernel"))
            .collect();
        assert_eq!(failed.len(), 1);
        let (code, result) = results
            .iter()
            .find(|(_, result)| !result.starts_with("failed to spawn kernel"))
            .unwrap();
        assert_eq!(result, code);
        assert_eq!(probe.spawns(), 2);
    }

    #[test]
    fn test_instance_id_is_stable() {
        let (_probe, tool, _dir) = interpreter_with(Script::Reply(vec![
            stdout("x"),
            status(ExecutionState::Idle),
        ]));
        let id = tool.instance_id().to_owned();
        tool.call("1", &[], None);
        assert_eq!(tool.instance_id(), id);
        assert!(tool.workspace().path().ends_with("code_interpreter_workspace"));
    }
}
