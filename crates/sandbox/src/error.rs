use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("failed to spawn kernel: {0}")]
    Spawn(String),
    #[error("kernel did not write {path:?} within {waited:?}")]
    StartupTimeout { path: PathBuf, waited: Duration },
    #[error("failed to attach to kernel: {0}")]
    Attach(String),
    #[error("execution timed out after {0:?}")]
    ExecutionTimeout(Duration),
    #[error("malformed tool parameters: {0}")]
    MalformedParams(String),
    #[error("kernel protocol error: {0}")]
    Protocol(String),
    #[error("kernel channel closed before execution finished")]
    ChannelClosed,
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SandboxError>;
