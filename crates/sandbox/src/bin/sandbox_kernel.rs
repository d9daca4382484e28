use std::env;
use std::io::{self, BufRead, BufReader, BufWriter, ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, mpsc};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, bail};
use clap::Parser;
use sandbox::SandboxError;
use sandbox::protocol::{
    ClientMessage, ConnectionInfo, ExecutionState, Frame, KernelMessage, ReplyStatus, StreamName,
    read_frame, write_frame,
};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

const ATTACHED_FILES_VAR: &str = "SANDBOX_ATTACHED_FILES";

#[derive(Parser, Debug)]
#[command(name = "sandbox_kernel", about = "Single-client code execution kernel")]
struct Args {
    /// Where to publish the connection descriptor.
    #[arg(long)]
    connection_file: PathBuf,

    #[arg(long)]
    session_id: String,

    #[arg(long, default_value = "python3")]
    interpreter: String,

    /// Passed to the interpreter before the code is piped to its stdin.
    #[arg(long = "interpreter-arg", allow_hyphen_values = true)]
    interpreter_args: Vec<String>,

    /// Exit if no client connects within this many seconds.
    #[arg(long, default_value_t = 60)]
    accept_timeout_secs: u64,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .with_target(false)
        .init();

    let args = Args::parse();
    let listener = TcpListener::bind("127.0.0.1:0").context("bind kernel socket")?;
    let port = listener.local_addr()?.port();
    let key = Uuid::new_v4().simple().to_string();

    let info = ConnectionInfo {
        transport: "tcp".to_owned(),
        ip: "127.0.0.1".to_owned(),
        port,
        key: key.clone(),
        session_id: args.session_id.clone(),
        pid: std::process::id(),
        interpreter: args.interpreter.clone(),
    };
    info.write_atomic(&args.connection_file)
        .with_context(|| format!("write {}", args.connection_file.display()))?;
    let _descriptor = Descriptor(args.connection_file.clone());
    debug!(port, session = %args.session_id, "kernel listening");

    let stream = accept_one(&listener, Duration::from_secs(args.accept_timeout_secs))?;
    drop(listener);
    serve(stream, &args, &key)
}

/// Removes the descriptor when the kernel exits normally.
struct Descriptor(PathBuf);

impl Drop for Descriptor {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.0)
            && err.kind() != ErrorKind::NotFound
        {
            warn!(error = %err, path = %self.0.display(), "failed to remove connection file");
        }
    }
}

fn accept_one(listener: &TcpListener, timeout: Duration) -> anyhow::Result<TcpStream> {
    let listener = listener.try_clone().context("clone listener")?;
    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name("kernel-accept".to_owned())
        .spawn(move || {
            let _ = tx.send(listener.accept());
        })
        .context("spawn accept thread")?;
    let (stream, peer) = match rx.recv_timeout(timeout) {
        Ok(accepted) => accepted.context("accept client")?,
        Err(_) => bail!("no client connected within {timeout:?}"),
    };
    stream.set_nodelay(true)?;
    debug!(%peer, "client connected");
    Ok(stream)
}

/// Serialises frames from the control loop and the execution thread onto
/// one socket with a single sequence counter.
#[derive(Clone)]
struct Outbox {
    inner: Arc<Mutex<OutboxInner>>,
}

struct OutboxInner {
    writer: BufWriter<TcpStream>,
    seq: u64,
}

impl Outbox {
    fn new(stream: TcpStream) -> Self {
        Self {
            inner: Arc::new(Mutex::new(OutboxInner {
                writer: BufWriter::new(stream),
                seq: 0,
            })),
        }
    }

    fn send(&self, parent: Option<u64>, msg: KernelMessage) {
        let mut inner = lock(&self.inner);
        inner.seq += 1;
        let frame = Frame {
            seq: inner.seq,
            parent,
            msg,
        };
        if let Err(err) = write_frame(&mut inner.writer, &frame) {
            debug!(error = %err, "client gone, dropping frame");
        }
    }
}

type Running = Arc<Mutex<Option<Child>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn serve(stream: TcpStream, args: &Args, key: &str) -> anyhow::Result<()> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let outbox = Outbox::new(stream);

    let Some(handshake) = read_frame::<ClientMessage>(&mut reader)? else {
        bail!("client disconnected before handshake");
    };
    match handshake.msg {
        ClientMessage::Handshake { key: ref offered } if offered == key => {}
        _ => {
            outbox.send(
                Some(handshake.seq),
                KernelMessage::Error {
                    ename: "HandshakeError".to_owned(),
                    evalue: "invalid or missing key".to_owned(),
                },
            );
            bail!("client failed the handshake");
        }
    }
    outbox.send(
        Some(handshake.seq),
        KernelMessage::Status {
            state: ExecutionState::Starting,
        },
    );
    outbox.send(
        Some(handshake.seq),
        KernelMessage::Ready {
            session_id: args.session_id.clone(),
            interpreter: args.interpreter.clone(),
        },
    );
    info!(session = %args.session_id, interpreter = %args.interpreter, "kernel ready");

    let running: Running = Arc::new(Mutex::new(None));
    let mut job: Option<JoinHandle<()>> = None;
    loop {
        let frame = match read_frame::<ClientMessage>(&mut reader) {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                debug!("client closed the connection");
                break;
            }
            Err(SandboxError::Protocol(reason)) => {
                warn!(%reason, "skipping client frame");
                continue;
            }
            Err(err) => {
                debug!(error = %err, "control read failed");
                break;
            }
        };
        match frame.msg {
            ClientMessage::Execute { code, files } => {
                if job.as_ref().is_some_and(|handle| !handle.is_finished()) {
                    outbox.send(
                        Some(frame.seq),
                        KernelMessage::Error {
                            ename: "KernelBusy".to_owned(),
                            evalue: "an execution is already running".to_owned(),
                        },
                    );
                    outbox.send(
                        Some(frame.seq),
                        KernelMessage::ExecuteReply {
                            status: ReplyStatus::Error,
                        },
                    );
                    continue;
                }
                let execution = Execution {
                    parent: frame.seq,
                    code,
                    files,
                    interpreter: args.interpreter.clone(),
                    interpreter_args: args.interpreter_args.clone(),
                    outbox: outbox.clone(),
                    running: running.clone(),
                };
                job = Some(
                    thread::Builder::new()
                        .name(format!("execute-{}", frame.seq))
                        .spawn(move || execution.run())
                        .context("spawn execution thread")?,
                );
            }
            ClientMessage::Shutdown => {
                outbox.send(Some(frame.seq), KernelMessage::ShutdownReply);
                break;
            }
            ClientMessage::Handshake { .. } => {
                warn!("ignoring repeated handshake");
            }
        }
    }

    if let Some(child) = lock(&running).as_mut() {
        debug!(pid = child.id(), "killing running interpreter");
        let _ = child.kill();
    }
    if let Some(handle) = job
        && handle.join().is_err()
    {
        warn!("execution thread panicked");
    }
    Ok(())
}

struct Execution {
    parent: u64,
    code: String,
    files: Vec<PathBuf>,
    interpreter: String,
    interpreter_args: Vec<String>,
    outbox: Outbox,
    running: Running,
}

impl Execution {
    fn run(self) {
        self.reply(KernelMessage::Status {
            state: ExecutionState::Busy,
        });
        let status = match self.interpret() {
            Ok(status) if status.success() => ReplyStatus::Ok,
            Ok(status) => {
                self.reply(KernelMessage::Error {
                    ename: "ExitStatus".to_owned(),
                    evalue: status.to_string(),
                });
                ReplyStatus::Error
            }
            Err(err) => {
                warn!(error = %err, interpreter = %self.interpreter, "interpreter failed");
                self.reply(KernelMessage::Stream {
                    name: StreamName::Stderr,
                    text: format!("{err}\n"),
                });
                self.reply(KernelMessage::Error {
                    ename: "InterpreterError".to_owned(),
                    evalue: err.to_string(),
                });
                ReplyStatus::Error
            }
        };
        self.reply(KernelMessage::ExecuteReply { status });
        self.reply(KernelMessage::Status {
            state: ExecutionState::Idle,
        });
    }

    fn reply(&self, msg: KernelMessage) {
        self.outbox.send(Some(self.parent), msg);
    }

    fn interpret(&self) -> anyhow::Result<ExitStatus> {
        let mut command = Command::new(&self.interpreter);
        // One pipe for both streams keeps their interleaving intact.
        let (output, writer) = io::pipe().context("interpreter output pipe")?;
        command
            .args(&self.interpreter_args)
            .stdin(Stdio::piped())
            .stdout(writer.try_clone()?)
            .stderr(writer);
        if !self.files.is_empty() {
            command.env(ATTACHED_FILES_VAR, env::join_paths(&self.files)?);
        }
        let spawned = command.spawn();
        // The command holds the write ends; drop it so the reader sees EOF.
        drop(command);
        let mut child =
            spawned.with_context(|| format!("failed to start interpreter {}", self.interpreter))?;
        debug!(pid = child.id(), "interpreter started");

        let stdin = child.stdin.take().context("interpreter stdin")?;
        *lock(&self.running) = Some(child);

        let code = self.code.clone();
        let feeder = thread::spawn(move || feed_stdin(stdin, &code));
        let _ = self.forward(output, StreamName::Stdout).join();
        let _ = feeder.join();

        let mut child = lock(&self.running)
            .take()
            .context("interpreter handle lost")?;
        Ok(child.wait()?)
    }

    fn forward(&self, pipe: impl Read + Send + 'static, name: StreamName) -> JoinHandle<()> {
        let outbox = self.outbox.clone();
        let parent = self.parent;
        thread::spawn(move || {
            let mut reader = BufReader::new(pipe);
            let mut line = Vec::new();
            loop {
                line.clear();
                match reader.read_until(b'\n', &mut line) {
                    Ok(0) => break,
                    Ok(_) => outbox.send(
                        Some(parent),
                        KernelMessage::Stream {
                            name,
                            text: String::from_utf8_lossy(&line).into_owned(),
                        },
                    ),
                    Err(err) => {
                        debug!(error = %err, ?name, "interpreter pipe closed");
                        break;
                    }
                }
            }
        })
    }
}

fn feed_stdin(mut stdin: impl Write, code: &str) {
    let mut payload = code.to_owned();
    if !payload.ends_with('\n') {
        payload.push('\n');
    }
    if let Err(err) = stdin.write_all(payload.as_bytes()) {
        debug!(error = %err, "interpreter stopped reading code");
    }
}
