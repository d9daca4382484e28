use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, info, info_span, trace, warn};

use crate::config::DEFAULT_EXECUTION_TIMEOUT;
use crate::error::{Result, SandboxError};
use crate::protocol::{ExecutionState, KernelMessage};
use crate::tool::FINISHED_EXECUTION;
use crate::workspace::Workspace;
use crate::{
    ChannelConnector, KernelChannel, KernelLauncher, KernelProcess, SessionId, remaining_until,
};

const LOG_PREVIEW_CHARS: usize = 120;

#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub code: String,
    pub timeout: Duration,
    pub files: Vec<PathBuf>,
}

impl ExecutionRequest {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            timeout: DEFAULT_EXECUTION_TIMEOUT,
            files: Vec::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_files(mut self, files: Vec<PathBuf>) -> Self {
        self.files = files;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionResult {
    Completed(String),
    EmptyOutput,
    Failed(String),
}

impl ExecutionResult {
    pub fn into_text(self) -> String {
        match self {
            ExecutionResult::Completed(text) => text,
            ExecutionResult::EmptyOutput => FINISHED_EXECUTION.to_owned(),
            ExecutionResult::Failed(reason) => reason,
        }
    }

    fn outcome(&self) -> &'static str {
        match self {
            ExecutionResult::Completed(_) => "completed",
            ExecutionResult::EmptyOutput => "empty",
            ExecutionResult::Failed(_) => "failed",
        }
    }
}

/// Runs each request in a fresh kernel: spawn, attach, send, pump until
/// idle, then close the channel and terminate the kernel on every path.
pub struct ExecutionSession {
    instance_id: String,
    sequence: AtomicU64,
    workspace: Workspace,
    launcher: Arc<dyn KernelLauncher>,
    connector: Arc<dyn ChannelConnector>,
}

impl ExecutionSession {
    pub fn new(
        instance_id: impl Into<String>,
        workspace: Workspace,
        launcher: Arc<dyn KernelLauncher>,
        connector: Arc<dyn ChannelConnector>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            sequence: AtomicU64::new(0),
            workspace,
            launcher,
            connector,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn next_session_id(&self) -> SessionId {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        SessionId::derive(&self.instance_id, sequence)
    }

    pub fn run(&self, request: &ExecutionRequest) -> ExecutionResult {
        if request.code.trim().is_empty() {
            return ExecutionResult::Completed(String::new());
        }
        let session_id = self.next_session_id();
        let span = info_span!("session", session = %session_id);
        let _entered = span.enter();
        debug!(code = %preview(&request.code), timeout = ?request.timeout, "executing");

        let started = Instant::now();
        let result = match self.execute(&session_id, request) {
            Ok(output) if output.trim().is_empty() => ExecutionResult::EmptyOutput,
            Ok(output) => ExecutionResult::Completed(output),
            Err(SandboxError::ExecutionTimeout(after)) => {
                warn!(?after, "execution timed out");
                ExecutionResult::Failed("timeout".to_owned())
            }
            Err(err) => {
                warn!(error = %err, "execution failed");
                ExecutionResult::Failed(err.to_string())
            }
        };
        info!(
            outcome = result.outcome(),
            elapsed_ms = started.elapsed().as_millis(),
            "session finished"
        );
        result
    }

    /// One deadline covers startup, attach and execution.
    fn execute(&self, session_id: &SessionId, request: &ExecutionRequest) -> Result<String> {
        let deadline = Instant::now().checked_add(request.timeout);
        let mut process = self
            .launcher
            .spawn(session_id, &self.workspace, remaining_until(deadline))
            .map_err(|err| expired_as_timeout(err, deadline, request.timeout))?;
        let outcome = self.attach_and_collect(process.as_ref(), request, deadline);
        if let Err(err) = process.terminate() {
            warn!(error = %err, kernel = %process.identifier(), "kernel teardown failed");
        }
        outcome
    }

    fn attach_and_collect(
        &self,
        process: &dyn KernelProcess,
        request: &ExecutionRequest,
        deadline: Option<Instant>,
    ) -> Result<String> {
        let remaining = remaining_until(deadline);
        if remaining.is_zero() {
            return Err(SandboxError::ExecutionTimeout(request.timeout));
        }
        let mut channel = self
            .connector
            .attach(process.connection_file(), remaining)
            .map_err(|err| expired_as_timeout(err, deadline, request.timeout))?;
        let outcome = channel
            .send(&request.code, &request.files)
            .and_then(|()| drain_until(channel.as_mut(), deadline, request.timeout));
        channel.close();
        outcome
    }
}

/// A startup or attach failure that happens once the deadline has passed is
/// reported as the caller's timeout.
fn expired_as_timeout(err: SandboxError, deadline: Option<Instant>, timeout: Duration) -> SandboxError {
    if remaining_until(deadline).is_zero() {
        debug!(error = %err, "deadline reached before execution started");
        SandboxError::ExecutionTimeout(timeout)
    } else {
        err
    }
}

/// Drains `channel` until the kernel reports idle, concatenating stream and
/// result text in arrival order. Fails with `ExecutionTimeout` once `timeout`
/// has elapsed without an idle status.
pub fn collect_output(channel: &mut dyn KernelChannel, timeout: Duration) -> Result<String> {
    drain_until(channel, Instant::now().checked_add(timeout), timeout)
}

fn drain_until(
    channel: &mut dyn KernelChannel,
    deadline: Option<Instant>,
    timeout: Duration,
) -> Result<String> {
    let mut output = String::new();
    loop {
        let remaining = remaining_until(deadline);
        if remaining.is_zero() {
            return Err(SandboxError::ExecutionTimeout(timeout));
        }
        let Some(message) = channel.receive(remaining)? else {
            return Err(SandboxError::ExecutionTimeout(timeout));
        };
        match message {
            KernelMessage::Stream { text, .. } | KernelMessage::ExecuteResult { text } => {
                output.push_str(&text);
            }
            KernelMessage::Status {
                state: ExecutionState::Idle,
            } => return Ok(output),
            KernelMessage::Error { ename, evalue } => {
                debug!(%ename, %evalue, "kernel reported an error");
            }
            other => trace!(?other, "ignoring kernel message"),
        }
    }
}

fn preview(code: &str) -> String {
    let mut chars = code.chars();
    let head: String = chars.by_ref().take(LOG_PREVIEW_CHARS).collect();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}
