use std::io::{BufReader, BufWriter};
use std::net::{Shutdown, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::error::{Result, SandboxError};
use crate::protocol::{ClientMessage, ConnectionInfo, Frame, KernelMessage, read_frame, write_frame};
use crate::{ChannelConnector, KernelChannel, remaining_until};

pub struct TcpConnector {
    ready_timeout: Duration,
}

impl TcpConnector {
    pub fn new(ready_timeout: Duration) -> Self {
        Self { ready_timeout }
    }
}

impl ChannelConnector for TcpConnector {
    fn attach(&self, connection_file: &Path, budget: Duration) -> Result<Box<dyn KernelChannel>> {
        Ok(Box::new(KernelClient::attach(
            connection_file,
            self.ready_timeout.min(budget),
        )?))
    }
}

/// Client side of one kernel connection. A listener thread decodes frames
/// into `inbox`; `receive` hands them out in arrival order.
pub struct KernelClient {
    stream: TcpStream,
    writer: BufWriter<TcpStream>,
    inbox: Receiver<Frame<KernelMessage>>,
    listener: Option<JoinHandle<()>>,
    next_seq: u64,
    current: Option<u64>,
    in_flight: bool,
    closed: bool,
}

impl KernelClient {
    pub fn attach(connection_file: &Path, ready_timeout: Duration) -> Result<Self> {
        let info = ConnectionInfo::load(connection_file)
            .map_err(|err| SandboxError::Attach(format!("{}: {err}", connection_file.display())))?;
        let addr = info
            .socket_addr()
            .map_err(|err| SandboxError::Attach(err.to_string()))?;
        let stream = TcpStream::connect_timeout(&addr, ready_timeout)
            .map_err(|err| SandboxError::Attach(format!("connect to {addr}: {err}")))?;
        stream.set_nodelay(true)?;
        let reader = stream.try_clone()?;
        let writer = BufWriter::new(stream.try_clone()?);

        let (sender, inbox) = mpsc::channel();
        let listener = thread::Builder::new()
            .name(format!("kernel-listener-{}", info.session_id))
            .spawn(move || pump_frames(reader, sender))
            .map_err(|err| SandboxError::Attach(format!("failed to spawn listener: {err}")))?;

        let mut client = Self {
            stream,
            writer,
            inbox,
            listener: Some(listener),
            next_seq: 1,
            current: None,
            in_flight: false,
            closed: false,
        };
        // On failure `client` drops here and `close` stops the listener.
        client.handshake(&info.key, ready_timeout)?;
        debug!(session = %info.session_id, pid = info.pid, "kernel channel attached");
        Ok(client)
    }

    fn handshake(&mut self, key: &str, ready_timeout: Duration) -> Result<()> {
        self.send_frame(ClientMessage::Handshake {
            key: key.to_owned(),
        })
        .map_err(|err| SandboxError::Attach(format!("handshake write failed: {err}")))?;
        let deadline = Instant::now().checked_add(ready_timeout);
        loop {
            let remaining = remaining_until(deadline);
            match self.inbox.recv_timeout(remaining) {
                Ok(frame) => match frame.msg {
                    KernelMessage::Ready { .. } => return Ok(()),
                    KernelMessage::Error { ename, evalue } => {
                        return Err(SandboxError::Attach(format!(
                            "kernel rejected handshake: {ename}: {evalue}"
                        )));
                    }
                    other => trace!(?other, "ignoring pre-ready message"),
                },
                Err(RecvTimeoutError::Timeout) => {
                    return Err(SandboxError::Attach(format!(
                        "kernel not ready within {ready_timeout:?}"
                    )));
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(SandboxError::Attach(
                        "kernel closed the connection during handshake".to_owned(),
                    ));
                }
            }
        }
    }

    fn send_frame(&mut self, msg: ClientMessage) -> Result<u64> {
        let seq = self.next_seq;
        self.next_seq += 1;
        write_frame(
            &mut self.writer,
            &Frame {
                seq,
                parent: None,
                msg,
            },
        )?;
        Ok(seq)
    }
}

impl KernelChannel for KernelClient {
    fn send(&mut self, code: &str, files: &[PathBuf]) -> Result<()> {
        if self.closed {
            return Err(SandboxError::ChannelClosed);
        }
        if self.in_flight {
            return Err(SandboxError::Protocol(
                "an execute request is already in flight on this channel".to_owned(),
            ));
        }
        let seq = self.send_frame(ClientMessage::Execute {
            code: code.to_owned(),
            files: files.to_vec(),
        })?;
        self.current = Some(seq);
        self.in_flight = true;
        Ok(())
    }

    fn receive(&mut self, timeout: Duration) -> Result<Option<KernelMessage>> {
        let deadline = Instant::now().checked_add(timeout);
        loop {
            let remaining = remaining_until(deadline);
            let frame = match self.inbox.recv_timeout(remaining) {
                Ok(frame) => frame,
                Err(RecvTimeoutError::Timeout) => return Ok(None),
                Err(RecvTimeoutError::Disconnected) => return Err(SandboxError::ChannelClosed),
            };
            if frame.parent != self.current {
                trace!(seq = frame.seq, parent = ?frame.parent, "dropping frame for another request");
                continue;
            }
            if frame.msg.is_idle() {
                self.in_flight = false;
            }
            return Ok(Some(frame.msg));
        }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(err) = self.send_frame(ClientMessage::Shutdown) {
            trace!(error = %err, "shutdown request not delivered");
        }
        let _ = self.stream.shutdown(Shutdown::Both);
        if let Some(listener) = self.listener.take()
            && listener.join().is_err()
        {
            warn!("kernel listener thread panicked");
        }
    }
}

impl Drop for KernelClient {
    fn drop(&mut self) {
        self.close();
    }
}

fn pump_frames(stream: TcpStream, sender: Sender<Frame<KernelMessage>>) {
    let mut reader = BufReader::new(stream);
    let mut last_seq = 0u64;
    loop {
        match read_frame::<KernelMessage>(&mut reader) {
            Ok(Some(frame)) => {
                if frame.seq <= last_seq {
                    warn!(seq = frame.seq, last_seq, "kernel frame out of sequence");
                }
                last_seq = last_seq.max(frame.seq);
                if sender.send(frame).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(SandboxError::Protocol(message)) => {
                warn!(%message, "skipping malformed kernel frame");
            }
            Err(err) => {
                debug!(error = %err, "kernel listener stopped");
                break;
            }
        }
    }
}
