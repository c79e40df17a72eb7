//! Local MIDI event source.
//!
//! Serves the same WebSocket protocol a hardware bridge would: every client is
//! greeted with `connection_established`, `ping` is answered with a flat
//! `pong` echoing the client's timestamp, and `get_status` /
//! `request_system_status` are answered with server statistics. Notes pushed
//! through the handle are broadcast to every connected client as
//! `midi_event` frames.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{Sink, SinkExt, StreamExt};
use rand::Rng;
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use crate::channel::protocol::DEFAULT_VELOCITY;
use crate::renderer::{PIANO_HIGHEST_NOTE, PIANO_LOWEST_NOTE};
use crate::scheduler::{SystemTimeSource, TimeSource};

/// C4 to C5.
pub const SCALE_NOTES: [i32; 8] = [60, 62, 64, 65, 67, 69, 71, 72];
pub const SCALE_VELOCITY: u8 = 80;
pub const SCALE_HOLD: Duration = Duration::from_millis(200);
pub const SCALE_GAP: Duration = Duration::from_millis(100);

/// Default hold time for a single simulated note.
pub const NOTE_HOLD: Duration = Duration::from_millis(500);

const GOING_AWAY: u16 = 1001;
const OUTBOUND_BUFFER: usize = 1024;

#[derive(Debug, Clone)]
enum Outbound {
    Text(Arc<str>),
    Drop { code: u16, reason: Arc<str> },
}

struct Shared {
    clients: AtomicUsize,
    events_sent: AtomicU64,
    started: Instant,
}

impl Shared {
    fn status(&self) -> Value {
        json!({
            "connected_clients": self.clients.load(Ordering::Relaxed),
            "events_processed": self.events_sent.load(Ordering::Relaxed),
            "uptime": self.started.elapsed().as_secs_f64(),
            "midi_connected": false,
        })
    }

    /// Reply to one client request, `None` for anything unanswerable.
    fn reply(&self, text: &str) -> Option<String> {
        let request: Value = serde_json::from_str(text).ok()?;
        let kind = request.get("type")?.as_str()?;
        let echoed = request
            .get("payload")
            .and_then(|payload| payload.get("timestamp"))
            .or_else(|| request.get("timestamp"))
            .cloned()
            .unwrap_or(Value::Null);
        let now = now_ms();

        let reply = match kind {
            "ping" => json!({
                "type": "pong",
                "timestamp": now,
                "client_timestamp": echoed,
            }),
            "get_status" => {
                let mut status = self.status();
                status["type"] = json!("status");
                status["timestamp"] = json!(now);
                status
            }
            "request_system_status" => json!({
                "type": "system_status",
                "payload": self.status(),
                "timestamp": now,
            }),
            _ => return None,
        };
        Some(reply.to_string())
    }
}

fn now_ms() -> f64 {
    SystemTimeSource::default().now_ms()
}

fn midi_frame(kind: &str, note: i32, velocity: u8) -> String {
    let now = now_ms();
    json!({
        "type": "midi_event",
        "event": {
            "type": kind,
            "note": note,
            "velocity": velocity,
            "channel": 0,
            "timestamp": now,
        },
        "server_timestamp": now,
    })
    .to_string()
}

/// Handle to a running simulator. Dropping it stops the server without
/// waiting for the listener to finish.
pub struct MidiSimulator {
    addr: SocketAddr,
    shared: Arc<Shared>,
    outbound: broadcast::Sender<Outbound>,
    shutdown: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
}

impl MidiSimulator {
    /// Bind and start accepting clients. Use port 0 for an ephemeral port.
    pub async fn bind(addr: &str) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        let shared = Arc::new(Shared {
            clients: AtomicUsize::new(0),
            events_sent: AtomicU64::new(0),
            started: Instant::now(),
        });
        let (outbound, _) = broadcast::channel(OUTBOUND_BUFFER);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let accept_task = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&shared),
            outbound.clone(),
            shutdown_rx,
        ));
        tracing::info!(%addr, "MIDI simulator listening");

        Ok(Self {
            addr,
            shared,
            outbound,
            shutdown,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Clients that completed the WebSocket handshake and are still open.
    pub fn client_count(&self) -> usize {
        self.shared.clients.load(Ordering::Relaxed)
    }

    pub fn events_sent(&self) -> u64 {
        self.shared.events_sent.load(Ordering::Relaxed)
    }

    /// Broadcast a raw text frame. Returns how many clients it was queued for.
    pub fn send_raw(&self, text: impl Into<String>) -> usize {
        let text: String = text.into();
        self.outbound
            .send(Outbound::Text(Arc::from(text)))
            .unwrap_or(0)
    }

    pub fn note_on(&self, note: i32, velocity: u8) -> usize {
        self.shared.events_sent.fetch_add(1, Ordering::Relaxed);
        self.send_raw(midi_frame("note_on", note, velocity))
    }

    pub fn note_off(&self, note: i32) -> usize {
        self.shared.events_sent.fetch_add(1, Ordering::Relaxed);
        self.send_raw(midi_frame("note_off", note, 0))
    }

    /// Close every client connection with `code`.
    pub fn drop_clients(&self, code: u16, reason: &str) -> usize {
        self.outbound
            .send(Outbound::Drop {
                code,
                reason: Arc::from(reason),
            })
            .unwrap_or(0)
    }

    /// Press `note`, hold it, release it.
    pub async fn play_note(&self, note: i32, velocity: Option<u8>, hold: Duration) {
        self.note_on(note, velocity.unwrap_or(DEFAULT_VELOCITY));
        tokio::time::sleep(hold).await;
        self.note_off(note);
    }

    /// C-major scale test sequence.
    pub async fn play_scale(&self) {
        for note in SCALE_NOTES {
            self.play_note(note, Some(SCALE_VELOCITY), SCALE_HOLD).await;
            tokio::time::sleep(SCALE_GAP).await;
        }
    }

    /// `count` notes with random pitch across the 88 keys and random velocity.
    pub async fn play_random(&self, count: usize) {
        let sequence: Vec<(i32, u8)> = {
            let mut rng = rand::thread_rng();
            (0..count)
                .map(|_| {
                    (
                        rng.gen_range(PIANO_LOWEST_NOTE..=PIANO_HIGHEST_NOTE),
                        rng.gen_range(32..=127),
                    )
                })
                .collect()
        };
        for (note, velocity) in sequence {
            self.play_note(note, Some(velocity), SCALE_HOLD).await;
            tokio::time::sleep(SCALE_GAP).await;
        }
    }

    /// Stop accepting, close every client with 1001 and wait for the listener.
    pub async fn shutdown(self) {
        self.shutdown.send_replace(true);
        if let Err(err) = self.accept_task.await {
            tracing::debug!("simulator accept task ended abnormally: {}", err);
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    shared: Arc<Shared>,
    outbound: broadcast::Sender<Outbound>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    // Subscribe before the handshake so nothing sent after the
                    // client sees itself connected can be missed.
                    let feed = outbound.subscribe();
                    tokio::spawn(serve_client(
                        stream,
                        peer,
                        Arc::clone(&shared),
                        feed,
                        shutdown.clone(),
                    ));
                }
                Err(err) => tracing::warn!("simulator accept failed: {}", err),
            },
            _ = shutdown.changed() => break,
        }
    }
    tracing::info!("MIDI simulator stopped");
}

async fn serve_client(
    stream: TcpStream,
    peer: SocketAddr,
    shared: Arc<Shared>,
    mut feed: broadcast::Receiver<Outbound>,
    mut shutdown: watch::Receiver<bool>,
) {
    let socket = match accept_async(stream).await {
        Ok(socket) => socket,
        Err(err) => {
            tracing::warn!(%peer, "handshake failed: {}", err);
            return;
        }
    };
    shared.clients.fetch_add(1, Ordering::Relaxed);
    tracing::info!(%peer, "client connected");
    let (mut sink, mut stream) = socket.split();

    let greeting = json!({
        "type": "connection_established",
        "timestamp": now_ms(),
        "server_info": {
            "version": env!("CARGO_PKG_VERSION"),
            "features": ["midi_events", "latency_tracking"],
        },
    });
    let mut open = sink.send(Message::text(greeting.to_string())).await.is_ok();

    while open {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if let Some(reply) = shared.reply(&text) {
                        open = sink.send(Message::text(reply)).await.is_ok();
                    } else {
                        tracing::debug!(%peer, "ignoring request {}", text);
                    }
                }
                Some(Ok(Message::Close(_))) | None => open = false,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    tracing::debug!(%peer, "client stream error: {}", err);
                    open = false;
                }
            },
            item = feed.recv() => match item {
                Ok(Outbound::Text(text)) => {
                    open = sink.send(Message::text(text.to_string())).await.is_ok();
                }
                Ok(Outbound::Drop { code, reason }) => {
                    close_client(&mut sink, code, &reason).await;
                    open = false;
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(%peer, skipped, "client fell behind the event feed");
                }
                Err(RecvError::Closed) => open = false,
            },
            _ = shutdown.changed() => {
                close_client(&mut sink, GOING_AWAY, "Server shutting down").await;
                open = false;
            }
        }
    }

    shared.clients.fetch_sub(1, Ordering::Relaxed);
    tracing::info!(%peer, "client disconnected");
}

async fn close_client<S>(sink: &mut S, code: u16, reason: &str)
where
    S: Sink<Message> + Unpin,
{
    let frame = CloseFrame {
        code: CloseCode::from(code),
        reason: reason.to_string().into(),
    };
    let _ = sink.send(Message::Close(Some(frame))).await;
    let _ = sink.close().await;
}
