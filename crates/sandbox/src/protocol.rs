use std::fs;
use std::io::{BufRead, Write};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SandboxError};

/// Connection descriptor a kernel writes on startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub transport: String,
    pub ip: String,
    pub port: u16,
    pub key: String,
    pub session_id: String,
    pub pid: u32,
    pub interpreter: String,
}

impl ConnectionInfo {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        serde_json::from_str(&raw)
            .map_err(|err| SandboxError::Protocol(format!("invalid connection file: {err}")))
    }

    /// Writes through a temporary file so readers never see a partial descriptor.
    pub fn write_atomic(&self, path: &Path) -> Result<()> {
        let payload = serde_json::to_vec_pretty(self)
            .map_err(|err| SandboxError::Protocol(err.to_string()))?;
        let mut staging = path.as_os_str().to_owned();
        staging.push(".tmp");
        let staging = PathBuf::from(staging);
        fs::write(&staging, payload)?;
        fs::rename(&staging, path)?;
        Ok(())
    }

    pub fn socket_addr(&self) -> Result<SocketAddr> {
        if self.transport != "tcp" {
            return Err(SandboxError::Protocol(format!(
                "unsupported transport {}",
                self.transport
            )));
        }
        let ip: IpAddr = self
            .ip
            .parse()
            .map_err(|err| SandboxError::Protocol(format!("invalid ip {}: {err}", self.ip)))?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

/// One line on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame<T> {
    pub seq: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<u64>,
    pub msg: T,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClientMessage {
    Handshake {
        key: String,
    },
    Execute {
        code: String,
        #[serde(default)]
        files: Vec<PathBuf>,
    },
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum KernelMessage {
    Ready {
        session_id: String,
        interpreter: String,
    },
    Status {
        state: ExecutionState,
    },
    Stream {
        name: StreamName,
        text: String,
    },
    ExecuteResult {
        text: String,
    },
    Error {
        ename: String,
        evalue: String,
    },
    ExecuteReply {
        status: ReplyStatus,
    },
    ShutdownReply,
    #[serde(other)]
    Unknown,
}

impl KernelMessage {
    pub fn is_idle(&self) -> bool {
        matches!(
            self,
            KernelMessage::Status {
                state: ExecutionState::Idle
            }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Starting,
    Busy,
    Idle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamName {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyStatus {
    Ok,
    Error,
}

pub fn write_frame<T: Serialize>(writer: &mut impl Write, frame: &Frame<T>) -> Result<()> {
    let line = serde_json::to_string(frame).map_err(|err| SandboxError::Protocol(err.to_string()))?;
    writer.write_all(line.as_bytes())?;
    writer.write_all(b"\n")?;
    writer.flush()?;
    Ok(())
}

/// Reads the next frame. `Ok(None)` on end of stream; a line that does not
/// decode yields `SandboxError::Protocol` and the reader stays usable.
pub fn read_frame<T: DeserializeOwned>(reader: &mut impl BufRead) -> Result<Option<Frame<T>>> {
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        if !line.trim().is_empty() {
            break;
        }
    }
    serde_json::from_str(line.trim_end())
        .map(Some)
        .map_err(|err| SandboxError::Protocol(format!("undecodable frame: {err}")))
}
