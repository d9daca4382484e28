//! In-crate doubles for the launcher and control channel.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::error::{Result, SandboxError};
use crate::protocol::{ExecutionState, KernelMessage, StreamName};
use crate::workspace::Workspace;
use crate::{ChannelConnector, KernelChannel, KernelLauncher, KernelProcess, SessionId};

#[derive(Clone)]
pub(crate) enum Script {
    /// Replays these messages after `send`.
    Reply(Vec<KernelMessage>),
    /// Streams the submitted code back, then goes idle.
    Echo,
    /// Never goes idle.
    Hang,
    /// `spawn` fails for the first request only.
    FailFirstSpawn,
    /// The kernel needs this long to publish its connection file; `spawn`
    /// gives up when its budget is shorter. Echoes once started.
    SlowStartup(Duration),
    FailAttach,
    /// `terminate` reports an error after killing.
    FailTeardown(Vec<KernelMessage>),
    Panic,
}

#[derive(Clone, Default)]
pub(crate) struct Probe {
    pub spawns: Arc<AtomicUsize>,
    pub terminations: Arc<AtomicUsize>,
    pub closes: Arc<AtomicUsize>,
    pub sent: Arc<Mutex<Vec<String>>>,
    pub connection_files: Arc<Mutex<Vec<PathBuf>>>,
}

impl Probe {
    pub fn spawns(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }

    pub fn terminations(&self) -> usize {
        self.terminations.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }
}

pub(crate) fn stdout(text: &str) -> KernelMessage {
    KernelMessage::Stream {
        name: StreamName::Stdout,
        text: text.to_owned(),
    }
}

pub(crate) fn status(state: ExecutionState) -> KernelMessage {
    KernelMessage::Status { state }
}

pub(crate) fn mock_parts(
    script: Script,
) -> (Probe, Arc<dyn KernelLauncher>, Arc<dyn ChannelConnector>) {
    let probe = Probe::default();
    let launcher = Arc::new(MockLauncher {
        probe: probe.clone(),
        script: script.clone(),
    });
    let connector = Arc::new(MockConnector {
        probe: probe.clone(),
        script,
    });
    (probe, launcher, connector)
}

struct MockLauncher {
    probe: Probe,
    script: Script,
}

impl KernelLauncher for MockLauncher {
    fn spawn(
        &self,
        session_id: &SessionId,
        workspace: &Workspace,
        budget: Duration,
    ) -> Result<Box<dyn KernelProcess>> {
        let previous = self.probe.spawns.fetch_add(1, Ordering::SeqCst);
        match self.script {
            Script::FailFirstSpawn if previous == 0 => {
                thread::sleep(Duration::from_millis(20));
                return Err(SandboxError::Spawn("interpreter not found".to_owned()));
            }
            Script::SlowStartup(delay) => {
                thread::sleep(delay.min(budget));
                if delay > budget {
                    return Err(SandboxError::StartupTimeout {
                        path: workspace.connection_file(session_id),
                        waited: budget,
                    });
                }
            }
            Script::Panic => panic!("launcher exploded"),
            _ => {}
        }
        let connection_file = workspace.connection_file(session_id);
        self.probe
            .connection_files
            .lock()
            .unwrap()
            .push(connection_file.clone());
        Ok(Box::new(MockProcess {
            probe: self.probe.clone(),
            connection_file,
            fail_teardown: matches!(self.script, Script::FailTeardown(_)),
            terminated: false,
        }))
    }
}

struct MockProcess {
    probe: Probe,
    connection_file: PathBuf,
    fail_teardown: bool,
    terminated: bool,
}

impl KernelProcess for MockProcess {
    fn connection_file(&self) -> &Path {
        &self.connection_file
    }

    fn terminate(&mut self) -> Result<()> {
        if self.terminated {
            return Ok(());
        }
        self.terminated = true;
        self.probe.terminations.fetch_add(1, Ordering::SeqCst);
        if self.fail_teardown {
            return Err(SandboxError::Io(std::io::Error::other("reap failed")));
        }
        Ok(())
    }

    fn identifier(&self) -> String {
        format!("mock:{}", self.connection_file.display())
    }
}

struct MockConnector {
    probe: Probe,
    script: Script,
}

impl ChannelConnector for MockConnector {
    fn attach(&self, _connection_file: &Path, _budget: Duration) -> Result<Box<dyn KernelChannel>> {
        if matches!(self.script, Script::FailAttach) {
            return Err(SandboxError::Attach("kernel not ready".to_owned()));
        }
        Ok(Box::new(MockChannel {
            probe: self.probe.clone(),
            script: self.script.clone(),
            queue: Vec::new(),
            closed: false,
        }))
    }
}

struct MockChannel {
    probe: Probe,
    script: Script,
    /// Pending messages, reversed so `pop` yields them in order.
    queue: Vec<KernelMessage>,
    closed: bool,
}

impl KernelChannel for MockChannel {
    fn send(&mut self, code: &str, _files: &[PathBuf]) -> Result<()> {
        self.probe.sent.lock().unwrap().push(code.to_owned());
        let mut messages = match &self.script {
            Script::Reply(messages) | Script::FailTeardown(messages) => messages.clone(),
            Script::Echo | Script::FailFirstSpawn | Script::SlowStartup(_) => vec![
                status(ExecutionState::Busy),
                stdout(code),
                status(ExecutionState::Idle),
            ],
            Script::Hang => vec![status(ExecutionState::Busy)],
            Script::FailAttach | Script::Panic => Vec::new(),
        };
        messages.reverse();
        self.queue = messages;
        Ok(())
    }

    fn receive(&mut self, timeout: Duration) -> Result<Option<KernelMessage>> {
        if let Some(message) = self.queue.pop() {
            return Ok(Some(message));
        }
        match self.script {
            Script::Hang => {
                thread::sleep(timeout);
                Ok(None)
            }
            _ => Err(SandboxError::ChannelClosed),
        }
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.probe.closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}
