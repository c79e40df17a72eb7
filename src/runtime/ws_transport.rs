//! WebSocket transport backed by tokio-tungstenite.
//!
//! Each `open` spawns one connection task. The task owns the socket and
//! reports back over an unbounded mpsc channel, tagging every event with the
//! generation it was started under. Opening again or closing bumps the
//! generation, so the driver can drop late events from a retired socket.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use crate::channel::{Transport, TransportEvent, ABNORMAL_CLOSURE, NORMAL_CLOSURE};
use crate::error::ChannelError;

/// Close code reported when the peer closed without a status.
const NO_STATUS_RECEIVED: u16 = 1005;

/// Transport event tagged with the socket generation that produced it.
pub type TaggedEvent = (u64, TransportEvent);

#[derive(Debug)]
enum SocketCommand {
    Send(String),
    Close { code: u16, reason: String },
}

pub struct WsTransport {
    events_tx: mpsc::UnboundedSender<TaggedEvent>,
    generation: u64,
    commands: Option<mpsc::UnboundedSender<SocketCommand>>,
    tasks: Vec<JoinHandle<()>>,
}

impl WsTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TaggedEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let transport = Self {
            events_tx,
            generation: 0,
            commands: None,
            tasks: Vec::new(),
        };
        (transport, events_rx)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether an event tagged `generation` comes from the live socket.
    pub fn is_current(&self, generation: u64) -> bool {
        self.commands.is_some() && generation == self.generation
    }

    fn retire(&mut self, code: u16, reason: &str) {
        if let Some(commands) = self.commands.take() {
            let _ = commands.send(SocketCommand::Close {
                code,
                reason: reason.to_string(),
            });
        }
        self.generation += 1;
    }

    /// Wait for connection tasks to finish their close handshakes.
    pub async fn drain(&mut self, timeout: Duration) {
        let pending: Vec<JoinHandle<()>> = self.tasks.drain(..).collect();
        let joined = futures::future::join_all(pending);
        if tokio::time::timeout(timeout, joined).await.is_err() {
            tracing::debug!("connection tasks still closing after {:?}", timeout);
        }
    }
}

impl Transport for WsTransport {
    fn open(&mut self, url: &str) -> Result<(), ChannelError> {
        let handle = tokio::runtime::Handle::try_current().map_err(|err| {
            ChannelError::TransportFailure {
                reason: format!("no async runtime: {}", err),
            }
        })?;

        self.retire(NORMAL_CLOSURE, "Superseded");
        self.tasks.retain(|task| !task.is_finished());

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        self.commands = Some(commands_tx);
        let generation = self.generation;

        let task = handle.spawn(connection_task(
            url.to_string(),
            generation,
            self.events_tx.clone(),
            commands_rx,
        ));
        self.tasks.push(task);
        Ok(())
    }

    fn send(&mut self, text: &str) -> Result<(), ChannelError> {
        let commands = self.commands.as_ref().ok_or(ChannelError::NotConnected)?;
        commands
            .send(SocketCommand::Send(text.to_string()))
            .map_err(|_| ChannelError::TransportFailure {
                reason: "connection task has stopped".to_string(),
            })
    }

    fn close(&mut self, code: u16, reason: &str) {
        self.retire(code, reason);
    }
}

async fn connection_task(
    url: String,
    generation: u64,
    events: mpsc::UnboundedSender<TaggedEvent>,
    mut commands: mpsc::UnboundedReceiver<SocketCommand>,
) {
    let report = |event: TransportEvent| {
        let _ = events.send((generation, event));
    };

    let connected = tokio::select! {
        result = connect_async(url.as_str()) => result,
        _ = commands.recv() => {
            tracing::debug!(generation, "connection attempt abandoned");
            return;
        }
    };

    let socket = match connected {
        Ok((socket, _response)) => socket,
        Err(err) => {
            tracing::warn!(generation, %url, "connect failed: {}", err);
            report(TransportEvent::Error(err.to_string()));
            return;
        }
    };

    tracing::debug!(generation, %url, "socket open");
    report(TransportEvent::Opened);
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(SocketCommand::Send(text)) => {
                    if let Err(err) = sink.send(Message::text(text)).await {
                        report(TransportEvent::Error(err.to_string()));
                        break;
                    }
                }
                Some(SocketCommand::Close { code, reason }) => {
                    let frame = CloseFrame {
                        code: CloseCode::from(code),
                        reason: reason.into(),
                    };
                    let _ = sink.send(Message::Close(Some(frame))).await;
                    let _ = sink.close().await;
                    break;
                }
                None => {
                    let _ = sink.close().await;
                    break;
                }
            },
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => report(TransportEvent::Text(text.to_string())),
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => report(TransportEvent::Text(text)),
                    Err(_) => tracing::debug!(generation, "ignoring non-UTF-8 binary frame"),
                },
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = frame
                        .map(|frame| (u16::from(frame.code), frame.reason.to_string()))
                        .unwrap_or((NO_STATUS_RECEIVED, String::new()));
                    report(TransportEvent::Closed { code, reason });
                    let _ = sink.close().await;
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    report(TransportEvent::Error(err.to_string()));
                    break;
                }
                None => {
                    report(TransportEvent::Closed {
                        code: ABNORMAL_CLOSURE,
                        reason: "stream ended".to_string(),
                    });
                    break;
                }
            }
        }
    }
}
