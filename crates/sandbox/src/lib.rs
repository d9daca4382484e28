pub mod client;
pub mod config;
pub mod error;
pub mod extract;
pub mod launcher;
pub mod protocol;
pub mod session;
pub mod tool;
pub mod workspace;

#[cfg(test)]
pub(crate) mod testing;

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

pub use config::SandboxConfig;
pub use error::{Result, SandboxError};
pub use protocol::KernelMessage;
pub use session::{ExecutionRequest, ExecutionResult, ExecutionSession};
pub use tool::{CodeInterpreter, FINISHED_EXECUTION, ToolInput};
pub use workspace::Workspace;

/// Names one execution request. Unique per in-flight request of a
/// `CodeInterpreter`, and used to name the kernel's connection file.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    pub fn derive(instance_id: &str, sequence: u64) -> Self {
        Self(format!("{instance_id}_{}_{sequence}", std::process::id()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A live kernel process. Owned by exactly one session.
pub trait KernelProcess: Send {
    fn connection_file(&self) -> &Path;
    /// Kills the kernel. Idempotent.
    fn terminate(&mut self) -> Result<()>;
    fn identifier(&self) -> String;
}

pub trait KernelLauncher: Send + Sync {
    /// Starts a kernel and waits at most `budget` for its connection file.
    fn spawn(
        &self,
        session_id: &SessionId,
        workspace: &Workspace,
        budget: Duration,
    ) -> Result<Box<dyn KernelProcess>>;
}

/// Messaging connection to one kernel.
pub trait KernelChannel: Send {
    fn send(&mut self, code: &str, files: &[PathBuf]) -> Result<()>;
    /// `Ok(None)` when `timeout` elapses with nothing to deliver.
    fn receive(&mut self, timeout: Duration) -> Result<Option<KernelMessage>>;
    fn close(&mut self);
}

pub trait ChannelConnector: Send + Sync {
    /// Connects and completes the handshake within `budget`.
    fn attach(&self, connection_file: &Path, budget: Duration) -> Result<Box<dyn KernelChannel>>;
}

/// Time left before `deadline`. `None` is a deadline too far out to
/// represent, so the wait is unbounded.
pub(crate) fn remaining_until(deadline: Option<Instant>) -> Duration {
    match deadline {
        Some(deadline) => deadline.saturating_duration_since(Instant::now()),
        None => Duration::MAX,
    }
}
