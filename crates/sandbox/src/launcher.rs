use std::env;
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::config::SandboxConfig;
use crate::error::{Result, SandboxError};
use crate::workspace::Workspace;
use crate::{KernelLauncher, KernelProcess, SessionId, remaining_until};

pub const KERNEL_BIN_NAME: &str = "sandbox_kernel";

pub fn build_launcher(config: &SandboxConfig) -> Result<Arc<dyn KernelLauncher>> {
    let kernel_bin = match &config.kernel_bin {
        Some(path) => path.clone(),
        None => resolve_kernel_bin()?,
    };
    Ok(Arc::new(LocalKernelLauncher {
        kernel_bin,
        interpreter: config.interpreter.clone(),
        interpreter_args: config.interpreter_args.clone(),
        startup_timeout: config.startup_timeout,
        poll_interval: config.poll_interval,
    }))
}

/// Starts `sandbox_kernel` processes on this host, one per session.
pub struct LocalKernelLauncher {
    kernel_bin: PathBuf,
    interpreter: String,
    interpreter_args: Vec<String>,
    startup_timeout: Duration,
    poll_interval: Duration,
}

impl KernelLauncher for LocalKernelLauncher {
    fn spawn(
        &self,
        session_id: &SessionId,
        workspace: &Workspace,
        budget: Duration,
    ) -> Result<Box<dyn KernelProcess>> {
        let connection_file = workspace.connection_file(session_id);
        let mut command = Command::new(&self.kernel_bin);
        command
            .arg("--connection-file")
            .arg(&connection_file)
            .arg("--session-id")
            .arg(session_id.as_str())
            .arg("--interpreter")
            .arg(&self.interpreter);
        for arg in &self.interpreter_args {
            command.arg(format!("--interpreter-arg={arg}"));
        }
        command
            .current_dir(workspace.path())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let mut child = command.spawn().map_err(|err| {
            SandboxError::Spawn(format!("{}: {err}", self.kernel_bin.display()))
        })?;
        forward_kernel_stderr(&mut child, session_id);
        debug!(pid = child.id(), "kernel process started");

        let mut process = LocalKernelProcess {
            child,
            connection_file,
            terminated: false,
        };
        let waited = wait_for_connection_file(
            &process.connection_file.clone(),
            self.startup_timeout.min(budget),
            self.poll_interval,
            || process.check_running(),
        );
        if let Err(err) = waited {
            if let Err(teardown) = process.terminate() {
                warn!(error = %teardown, "failed to reap kernel after startup failure");
            }
            return Err(err);
        }
        Ok(Box::new(process))
    }
}

/// Polls until `path` holds valid JSON. Fails once `timeout` has elapsed or
/// when `check_alive` reports the kernel is gone.
pub fn wait_for_connection_file(
    path: &Path,
    timeout: Duration,
    interval: Duration,
    mut check_alive: impl FnMut() -> Result<()>,
) -> Result<()> {
    let started = Instant::now();
    let deadline = started.checked_add(timeout);
    loop {
        if connection_file_ready(path) {
            debug!(waited_ms = started.elapsed().as_millis(), "connection file ready");
            return Ok(());
        }
        check_alive()?;
        let remaining = remaining_until(deadline);
        if remaining.is_zero() {
            return Err(SandboxError::StartupTimeout {
                path: path.to_path_buf(),
                waited: timeout,
            });
        }
        thread::sleep(interval.min(remaining));
    }
}

fn connection_file_ready(path: &Path) -> bool {
    fs::read(path)
        .ok()
        .is_some_and(|bytes| serde_json::from_slice::<serde_json::Value>(&bytes).is_ok())
}

struct LocalKernelProcess {
    child: Child,
    connection_file: PathBuf,
    terminated: bool,
}

impl LocalKernelProcess {
    fn check_running(&mut self) -> Result<()> {
        match self.child.try_wait()? {
            Some(status) => Err(SandboxError::Spawn(format!(
                "kernel exited with {status} before writing its connection file"
            ))),
            None => Ok(()),
        }
    }
}

impl KernelProcess for LocalKernelProcess {
    fn connection_file(&self) -> &Path {
        &self.connection_file
    }

    fn terminate(&mut self) -> Result<()> {
        if self.terminated {
            return Ok(());
        }
        self.terminated = true;
        #[cfg(unix)]
        kill_process_group(self.child.id());
        if let Err(err) = self.child.kill() {
            // InvalidInput means the child was already reaped.
            if err.kind() != std::io::ErrorKind::InvalidInput {
                debug!(error = %err, "kernel kill failed");
            }
        }
        let status = self.child.wait()?;
        debug!(%status, "kernel process reaped");
        match fs::remove_file(&self.connection_file) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn identifier(&self) -> String {
        format!("pid:{}", self.child.id())
    }
}

impl Drop for LocalKernelProcess {
    fn drop(&mut self) {
        let _ = self.terminate();
    }
}

/// The kernel leads its own process group, so this also reaches the
/// interpreter it is running.
#[cfg(unix)]
fn kill_process_group(pid: u32) {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // ESRCH (group already gone) is fine.
    unsafe {
        libc::killpg(pgid, libc::SIGKILL);
    }
}

fn forward_kernel_stderr(child: &mut Child, session_id: &SessionId) {
    let Some(stderr) = child.stderr.take() else {
        return;
    };
    let session = session_id.to_string();
    let spawned = thread::Builder::new()
        .name(format!("kernel-stderr-{session}"))
        .spawn(move || {
            for line in BufReader::new(stderr).lines() {
                match line {
                    Ok(line) => debug!(target: "sandbox_kernel", session = %session, "{line}"),
                    Err(_) => break,
                }
            }
        });
    if let Err(err) = spawned {
        warn!(error = %err, "failed to spawn kernel stderr forwarder");
    }
}

fn resolve_kernel_bin() -> Result<PathBuf> {
    let current = env::current_exe()
        .map_err(|err| SandboxError::Spawn(format!("failed to resolve current executable: {err}")))?;
    let mut dir = current
        .parent()
        .ok_or_else(|| SandboxError::Spawn("failed to resolve executable directory".to_owned()))?
        .to_path_buf();
    // Test binaries live one level down in target/<profile>/deps.
    if dir.ends_with("deps") {
        dir.pop();
    }
    let mut kernel = dir.join(KERNEL_BIN_NAME);
    if let Some(ext) = current.extension() {
        kernel.set_extension(ext);
    }
    if !kernel.exists() {
        return Err(SandboxError::Spawn(format!(
            "kernel binary not found at {}. Build it with `cargo build -p sandbox --bin sandbox_kernel` or set SANDBOX_KERNEL_BIN",
            kernel.display()
        )));
    }
    Ok(kernel)
}
