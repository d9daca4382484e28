use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, SandboxError};

pub const DEFAULT_EXECUTION_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_INTERPRETER: &str = "python3";
pub const DEFAULT_INTERPRETER_ARGS: [&str; 2] = ["-u", "-"];

const KERNEL_BIN_VAR: &str = "SANDBOX_KERNEL_BIN";
const INTERPRETER_VAR: &str = "SANDBOX_INTERPRETER";
const STARTUP_TIMEOUT_VAR: &str = "SANDBOX_STARTUP_TIMEOUT_SECS";
const READY_TIMEOUT_VAR: &str = "SANDBOX_READY_TIMEOUT_SECS";
const EXECUTION_TIMEOUT_VAR: &str = "SANDBOX_EXECUTION_TIMEOUT_SECS";

#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Kernel binary. Resolved next to the current executable when unset.
    pub kernel_bin: Option<PathBuf>,
    pub interpreter: String,
    pub interpreter_args: Vec<String>,
    pub startup_timeout: Duration,
    pub ready_timeout: Duration,
    pub poll_interval: Duration,
    pub execution_timeout: Duration,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            kernel_bin: None,
            interpreter: DEFAULT_INTERPRETER.to_owned(),
            interpreter_args: DEFAULT_INTERPRETER_ARGS
                .iter()
                .map(|arg| (*arg).to_owned())
                .collect(),
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            ready_timeout: DEFAULT_READY_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            execution_timeout: DEFAULT_EXECUTION_TIMEOUT,
        }
    }
}

impl SandboxConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(bin) = lookup(KERNEL_BIN_VAR).filter(|value| !value.trim().is_empty()) {
            config.kernel_bin = Some(PathBuf::from(bin.trim()));
        }
        if let Some(command) = lookup(INTERPRETER_VAR) {
            let mut parts = command.split_whitespace().map(str::to_owned);
            let program = parts
                .next()
                .ok_or_else(|| SandboxError::Config(format!("{INTERPRETER_VAR} is empty")))?;
            config.interpreter = program;
            config.interpreter_args = parts.collect();
        }
        config.startup_timeout = secs_var(&lookup, STARTUP_TIMEOUT_VAR, config.startup_timeout)?;
        config.ready_timeout = secs_var(&lookup, READY_TIMEOUT_VAR, config.ready_timeout)?;
        config.execution_timeout =
            secs_var(&lookup, EXECUTION_TIMEOUT_VAR, config.execution_timeout)?;
        Ok(config)
    }
}

fn secs_var(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: Duration,
) -> Result<Duration> {
    let Some(raw) = lookup(name) else {
        return Ok(default);
    };
    let secs: f64 = raw
        .trim()
        .parse()
        .map_err(|_| SandboxError::Config(format!("{name} must be a number of seconds")))?;
    if !secs.is_finite() || secs <= 0.0 {
        return Err(SandboxError::Config(format!("{name} must be positive")));
    }
    Duration::try_from_secs_f64(secs)
        .map_err(|err| SandboxError::Config(format!("{name} is out of range: {err}")))
}
