//! DAP client connection.
//!
//! One task owns the socket, the frame buffer, the sequence counter and the
//! pending-request table. [`DapClient`] handles talk to it over a channel, so
//! a connection's state is only ever touched by its own task. Events from the
//! adapter are forwarded on an unbounded channel; when the connection ends
//! every pending request fails and [`ClientEvent::Closed`] is sent last.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use super::{encode_frame, Event, FrameDecoder, ProtocolMessage, Request, Response};
use crate::error::{Result, SandboxError};

const READ_CHUNK: usize = 8192;

/// What the connection reports to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Event(Event),
    /// The socket closed or failed. Always the last item.
    Closed,
}

enum Command {
    Request {
        command: String,
        arguments: Option<Value>,
        reply: oneshot::Sender<Result<Option<Value>>>,
    },
    WaitEvent {
        event: String,
        reply: oneshot::Sender<()>,
    },
    Shutdown,
}

/// Cloneable handle to a DAP connection task.
#[derive(Debug, Clone)]
pub struct DapClient {
    commands: mpsc::UnboundedSender<Command>,
}

impl DapClient {
    /// Start the connection task over an established stream.
    pub fn spawn<S>(stream: S) -> (Self, mpsc::UnboundedReceiver<ClientEvent>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let connection = Connection {
            reader,
            writer,
            next_seq: 1,
            pending: HashMap::new(),
            decoder: FrameDecoder::new(),
            seen_events: HashSet::new(),
            waiters: HashMap::new(),
            events: event_tx,
        };
        tokio::spawn(connection.run(command_rx));

        (
            Self {
                commands: command_tx,
            },
            event_rx,
        )
    }

    /// Connect over TCP, retrying with a fixed backoff, then start the connection task.
    pub async fn connect(
        address: &str,
        attempts: u32,
        backoff: Duration,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ClientEvent>)> {
        let stream = connect_with_retry(address, attempts, backoff, || TcpStream::connect(address)).await?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Failed to set TCP_NODELAY");
        }
        Ok(Self::spawn(stream))
    }

    /// Send a request and wait for its response body.
    ///
    /// A response with `success: false` becomes
    /// [`SandboxError::DebugCommandFailed`] carrying the adapter's message.
    pub async fn request(&self, command: &str, arguments: Option<Value>) -> Result<Option<Value>> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Request {
                command: command.to_string(),
                arguments,
                reply,
            })
            .map_err(|_| closed(command))?;
        response.await.map_err(|_| closed(command))?
    }

    /// Send a request and decode its response body.
    pub async fn request_as<T: DeserializeOwned>(
        &self,
        command: &str,
        arguments: Option<Value>,
    ) -> Result<T> {
        let body = self
            .request(command, arguments)
            .await?
            .unwrap_or_else(|| Value::Object(serde_json::Map::new()));
        serde_json::from_value(body).map_err(|e| SandboxError::DebugCommandFailed {
            command: command.to_string(),
            message: format!("Unexpected response body: {e}"),
        })
    }

    /// Resolve once `event` has been received. Returns immediately if it already was.
    pub async fn wait_for_event(&self, event: &str) -> Result<()> {
        let (reply, seen) = oneshot::channel();
        self.commands
            .send(Command::WaitEvent {
                event: event.to_string(),
                reply,
            })
            .map_err(|_| closed(event))?;
        seen.await.map_err(|_| closed(event))
    }

    /// Close the socket. Pending requests fail; the event stream ends with `Closed`.
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}

fn closed(what: &str) -> SandboxError {
    SandboxError::DebugCommandFailed {
        command: what.to_string(),
        message: "Debug connection closed".into(),
    }
}

/// Retry `connect` up to `attempts` times, sleeping `backoff` between failures.
///
/// Exhausting the budget yields [`SandboxError::DebuggerUnreachable`].
pub async fn connect_with_retry<F, Fut, T>(
    address: &str,
    attempts: u32,
    backoff: Duration,
    mut connect: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<T>>,
{
    for attempt in 1..=attempts {
        match connect().await {
            Ok(stream) => {
                info!(address, attempt, "Connected to debug adapter");
                return Ok(stream);
            }
            Err(e) => {
                debug!(address, attempt, error = %e, "Debug adapter not accepting connections yet");
                if attempt < attempts {
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
    warn!(address, attempts, "Giving up on debug adapter");
    Err(SandboxError::DebuggerUnreachable {
        address: address.to_string(),
        attempts,
    })
}

struct Pending {
    command: String,
    reply: oneshot::Sender<Result<Option<Value>>>,
}

struct Connection<S> {
    reader: ReadHalf<S>,
    writer: WriteHalf<S>,
    next_seq: i64,
    pending: HashMap<i64, Pending>,
    decoder: FrameDecoder,
    seen_events: HashSet<String>,
    waiters: HashMap<String, Vec<oneshot::Sender<()>>>,
    events: mpsc::UnboundedSender<ClientEvent>,
}

impl<S: AsyncRead + AsyncWrite + Send + 'static> Connection<S> {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Request { command, arguments, reply }) => {
                        if let Err(e) = self.send_request(command, arguments, reply).await {
                            warn!(error = %e, "Failed to write to debug adapter");
                            break;
                        }
                    }
                    Some(Command::WaitEvent { event, reply }) => {
                        if self.seen_events.contains(&event) {
                            let _ = reply.send(());
                        } else {
                            self.waiters.entry(event).or_default().push(reply);
                        }
                    }
                    Some(Command::Shutdown) | None => {
                        debug!("Closing debug connection");
                        break;
                    }
                },
                read = self.reader.read(&mut chunk) => match read {
                    Ok(0) => {
                        debug!("Debug adapter closed the connection");
                        break;
                    }
                    Ok(n) => {
                        self.decoder.push(&chunk[..n]);
                        if let Err(e) = self.drain_frames() {
                            warn!(error = %e, "Malformed frame from debug adapter");
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "Debug connection read failed");
                        break;
                    }
                },
            }
        }
        self.close().await;
    }

    async fn send_request(
        &mut self,
        command: String,
        arguments: Option<Value>,
        reply: oneshot::Sender<Result<Option<Value>>>,
    ) -> std::io::Result<()> {
        let seq = self.next_seq;
        self.next_seq += 1;

        let message = ProtocolMessage::Request(Request {
            seq,
            command: command.clone(),
            arguments,
        });
        let frame = match encode_frame(&message) {
            Ok(frame) => frame,
            Err(e) => {
                let _ = reply.send(Err(e.into()));
                return Ok(());
            }
        };

        trace!(seq, command = %command, "-> request");
        self.pending.insert(seq, Pending { command, reply });
        self.writer.write_all(&frame).await?;
        self.writer.flush().await
    }

    fn drain_frames(&mut self) -> std::result::Result<(), super::FrameError> {
        while let Some(body) = self.decoder.next_frame()? {
            match serde_json::from_slice::<ProtocolMessage>(&body) {
                Ok(message) => self.dispatch(message),
                Err(e) => warn!(error = %e, "Ignoring undecodable debug message"),
            }
        }
        Ok(())
    }

    fn dispatch(&mut self, message: ProtocolMessage) {
        match message {
            ProtocolMessage::Response(response) => self.resolve(response),
            ProtocolMessage::Event(event) => {
                trace!(event = %event.event, "<- event");
                if let Some(waiters) = self.waiters.remove(&event.event) {
                    for waiter in waiters {
                        let _ = waiter.send(());
                    }
                }
                self.seen_events.insert(event.event.clone());
                let _ = self.events.send(ClientEvent::Event(event));
            }
            ProtocolMessage::Request(request) => {
                debug!(command = %request.command, "Ignoring reverse request from debug adapter");
            }
        }
    }

    fn resolve(&mut self, response: Response) {
        let Some(pending) = self.pending.remove(&response.request_seq) else {
            debug!(request_seq = response.request_seq, "Response for unknown request");
            return;
        };
        trace!(request_seq = response.request_seq, success = response.success, "<- response");

        let result = if response.success {
            Ok(response.body)
        } else {
            Err(SandboxError::DebugCommandFailed {
                command: pending.command,
                message: response
                    .message
                    .unwrap_or_else(|| "Request rejected by debug adapter".into()),
            })
        };
        let _ = pending.reply.send(result);
    }

    async fn close(mut self) {
        for (_, pending) in self.pending.drain() {
            let _ = pending.reply.send(Err(closed(&pending.command)));
        }
        self.waiters.clear();
        let _ = self.writer.shutdown().await;
        let _ = self.events.send(ClientEvent::Closed);
    }
}
