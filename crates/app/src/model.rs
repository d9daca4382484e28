use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::agents::ModelSlot;

pub const GENERAL_CONFIG_PATH: &str = "./data/config_general.json";

const BYTES_PER_MIB: u64 = 1024 * 1024;
const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("configuration file not found at {0}")]
    ConfigMissing(PathBuf),
    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] serde_json::Error),
    #[error("model file not found: {0}")]
    ModelMissing(PathBuf),
    #[error("model {model} needs {size_mib} MiB but the budget is {budget_mib} MiB")]
    OverBudget {
        model: PathBuf,
        size_mib: u64,
        budget_mib: u64,
    },
    #[error("model runner failed: {0}")]
    Runner(String),
    #[error("model runner timed out after {0:?}")]
    Timeout(Duration),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Contents of `config_general.json`.
#[derive(Clone, Debug, Deserialize)]
pub struct GeneralConfig {
    pub chat_model_used: PathBuf,
    pub instruct_model_used: PathBuf,
    pub code_model_used: PathBuf,
    /// MiB.
    pub maximum_memory_usage: u64,
    #[serde(default)]
    pub tool_timeout_secs: Option<u64>,
}

impl GeneralConfig {
    pub fn model_for(&self, slot: ModelSlot) -> &Path {
        match slot {
            ModelSlot::Chat => &self.chat_model_used,
            ModelSlot::Instruct => &self.instruct_model_used,
            ModelSlot::Code => &self.code_model_used,
        }
    }

    pub fn tool_timeout(&self) -> Option<Duration> {
        self.tool_timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

pub fn load_config(path: &Path) -> Result<GeneralConfig, ModelError> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(ModelError::ConfigMissing(path.to_path_buf()));
        }
        Err(err) => return Err(err.into()),
    };
    Ok(serde_json::from_str(&raw)?)
}

/// Returns the configured model files that do not exist.
pub fn check_model_paths(config: &GeneralConfig) -> Vec<PathBuf> {
    [
        &config.chat_model_used,
        &config.instruct_model_used,
        &config.code_model_used,
    ]
    .into_iter()
    .filter(|path| !path.is_file())
    .cloned()
    .collect()
}

#[async_trait]
pub trait ModelRunner: Send + Sync {
    async fn run(
        &self,
        model: &Path,
        prompt: &str,
        max_memory_mib: u64,
    ) -> Result<String, ModelError>;
}

/// Runs prompts through an external `llama-cli` style binary.
pub struct LlamaCliRunner {
    binary: PathBuf,
    extra_args: Vec<String>,
    timeout: Duration,
}

impl LlamaCliRunner {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            extra_args: Vec::new(),
            timeout: DEFAULT_RUN_TIMEOUT,
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = String>) -> Self {
        self.extra_args.extend(args);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl ModelRunner for LlamaCliRunner {
    async fn run(
        &self,
        model: &Path,
        prompt: &str,
        max_memory_mib: u64,
    ) -> Result<String, ModelError> {
        let size = match tokio::fs::metadata(model).await {
            Ok(metadata) => metadata.len(),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(ModelError::ModelMissing(model.to_path_buf()));
            }
            Err(err) => return Err(err.into()),
        };
        let size_mib = size.div_ceil(BYTES_PER_MIB);
        if size_mib > max_memory_mib {
            return Err(ModelError::OverBudget {
                model: model.to_path_buf(),
                size_mib,
                budget_mib: max_memory_mib,
            });
        }

        debug!(model = %model.display(), size_mib, "running model");
        let child = Command::new(&self.binary)
            .arg("-m")
            .arg(model)
            .arg("-p")
            .arg(prompt)
            .args(&self.extra_args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| ModelError::Runner(format!("{}: {err}", self.binary.display())))?;
        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| ModelError::Timeout(self.timeout))??;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(status = %output.status, "model runner exited with failure");
            return Err(ModelError::Runner(format!(
                "{}: {}",
                output.status,
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned())
    }
}
