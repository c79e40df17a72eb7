//! Connection channel to the MIDI event source.
//!
//! Owns the connection lifecycle (connect, bounded exponential-backoff
//! reconnect, give up), the outgoing FIFO used while offline, and the
//! latency sample window. Inbound frames are decoded and fanned out to typed
//! subscriber registries.
//!
//! The channel is sans-I/O: socket activity goes through a [`Transport`],
//! socket outcomes come back through [`ConnectionChannel::handle_transport_event`],
//! and reconnect delays are deferred tasks fired by
//! [`ConnectionChannel::fire_due_timers`].

use std::collections::VecDeque;
use std::rc::Rc;

use serde::Serialize;
use serde_json::Value;

use crate::config::ChannelConfig;
use crate::error::{log_channel_error, ChannelError, ErrorCode};
use crate::scheduler::{DeferredQueue, TaskHandle, TimeSource};
use crate::subscribers::{SubscriptionId, Subscribers};
use crate::telemetry::{ChannelPhase, ConnectionSummary, LatencyStats, LatencyWindow};

pub mod protocol;
pub mod transport;


pub use protocol::{Envelope, InboundMessage, MidiEvent, MidiEventKind, OutboundMessage};
pub use transport::{RecordingTransport, Transport, TransportEvent};

/// Clean, client-initiated closure. Never followed by a reconnect.
pub const NORMAL_CLOSURE: u16 = 1000;

/// Closure without a close frame (socket error, failed open).
pub const ABNORMAL_CLOSURE: u16 = 1006;

/// Close code used when the channel abandons a socket that failed a send.
pub const INTERNAL_ERROR_CLOSURE: u16 = 1011;

/// Payload of the `disconnected` event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Disconnection {
    pub code: u16,
    pub reason: String,
}

/// Payload of the `reconnecting` event.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ReconnectScheduled {
    pub attempt: u32,
    pub delay_ms: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChannelTask {
    Reconnect,
}

/// Connectivity flag, attempt counter, offline queue and latency ring.
#[derive(Debug)]
pub struct ChannelState {
    connected: bool,
    reconnect_attempts: u32,
    outgoing: VecDeque<String>,
    latency: LatencyWindow,
}

impl ChannelState {
    fn new(latency_window: usize) -> Self {
        Self {
            connected: false,
            reconnect_attempts: 0,
            outgoing: VecDeque::new(),
            latency: LatencyWindow::new(latency_window),
        }
    }

    pub fn connected(&self) -> bool {
        self.connected
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    pub fn queued(&self) -> impl Iterator<Item = &str> {
        self.outgoing.iter().map(String::as_str)
    }

    pub fn latency(&self) -> &LatencyWindow {
        &self.latency
    }
}

struct ChannelSubscribers {
    connected: Subscribers<()>,
    disconnected: Subscribers<Disconnection>,
    error: Subscribers<ChannelError>,
    reconnecting: Subscribers<ReconnectScheduled>,
    max_reconnect_attempts: Subscribers<u32>,
    midi_event: Subscribers<MidiEvent>,
    note_on: Subscribers<MidiEvent>,
    note_off: Subscribers<MidiEvent>,
    control_change: Subscribers<MidiEvent>,
    program_change: Subscribers<MidiEvent>,
    pitch_bend: Subscribers<MidiEvent>,
    generic: Subscribers<MidiEvent>,
    system_status: Subscribers<Value>,
    server_info: Subscribers<Value>,
    round_trip: Subscribers<f64>,
}

impl ChannelSubscribers {
    fn new() -> Self {
        Self {
            connected: Subscribers::new("connected"),
            disconnected: Subscribers::new("disconnected"),
            error: Subscribers::new("error"),
            reconnecting: Subscribers::new("reconnecting"),
            max_reconnect_attempts: Subscribers::new("max_reconnect_attempts"),
            midi_event: Subscribers::new("midi_event"),
            note_on: Subscribers::new("note_on"),
            note_off: Subscribers::new("note_off"),
            control_change: Subscribers::new("control_change"),
            program_change: Subscribers::new("program_change"),
            pitch_bend: Subscribers::new("pitch_bend"),
            generic: Subscribers::new("generic"),
            system_status: Subscribers::new("system_status"),
            server_info: Subscribers::new("server_info"),
            round_trip: Subscribers::new("round_trip"),
        }
    }

    fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.connected.unsubscribe(id)
            || self.disconnected.unsubscribe(id)
            || self.error.unsubscribe(id)
            || self.reconnecting.unsubscribe(id)
            || self.max_reconnect_attempts.unsubscribe(id)
            || self.midi_event.unsubscribe(id)
            || self.note_on.unsubscribe(id)
            || self.note_off.unsubscribe(id)
            || self.control_change.unsubscribe(id)
            || self.program_change.unsubscribe(id)
            || self.pitch_bend.unsubscribe(id)
            || self.generic.unsubscribe(id)
            || self.system_status.unsubscribe(id)
            || self.server_info.unsubscribe(id)
            || self.round_trip.unsubscribe(id)
    }
}

/// Auto-reconnecting, duplicate-tolerant message channel.
pub struct ConnectionChannel<T: Transport> {
    config: ChannelConfig,
    transport: T,
    clock: Rc<dyn TimeSource>,
    phase: ChannelPhase,
    state: ChannelState,
    intentional_close: bool,
    timers: DeferredQueue<ChannelTask>,
    reconnect_handle: Option<TaskHandle>,
    subscribers: ChannelSubscribers,
}

impl<T: Transport> ConnectionChannel<T> {
    pub fn new(config: ChannelConfig, transport: T, clock: Rc<dyn TimeSource>) -> Self {
        let state = ChannelState::new(config.latency_window);
        Self {
            config,
            transport,
            clock,
            phase: ChannelPhase::Disconnected,
            state,
            intentional_close: false,
            timers: DeferredQueue::new(),
            reconnect_handle: None,
            subscribers: ChannelSubscribers::new(),
        }
    }

    // ------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------

    pub fn on_connected<F: FnMut(&()) + 'static>(&mut self, callback: F) -> SubscriptionId {
        self.subscribers.connected.subscribe(callback)
    }

    pub fn on_disconnected<F: FnMut(&Disconnection) + 'static>(
        &mut self,
        callback: F,
    ) -> SubscriptionId {
        self.subscribers.disconnected.subscribe(callback)
    }

    pub fn on_error<F: FnMut(&ChannelError) + 'static>(&mut self, callback: F) -> SubscriptionId {
        self.subscribers.error.subscribe(callback)
    }

    pub fn on_reconnecting<F: FnMut(&ReconnectScheduled) + 'static>(
        &mut self,
        callback: F,
    ) -> SubscriptionId {
        self.subscribers.reconnecting.subscribe(callback)
    }

    pub fn on_max_reconnect_attempts<F: FnMut(&u32) + 'static>(
        &mut self,
        callback: F,
    ) -> SubscriptionId {
        self.subscribers.max_reconnect_attempts.subscribe(callback)
    }

    /// Every validated MIDI event, whatever its kind.
    pub fn on_midi_event<F: FnMut(&MidiEvent) + 'static>(&mut self, callback: F) -> SubscriptionId {
        self.subscribers.midi_event.subscribe(callback)
    }

    pub fn on_note_on<F: FnMut(&MidiEvent) + 'static>(&mut self, callback: F) -> SubscriptionId {
        self.subscribers.note_on.subscribe(callback)
    }

    pub fn on_note_off<F: FnMut(&MidiEvent) + 'static>(&mut self, callback: F) -> SubscriptionId {
        self.subscribers.note_off.subscribe(callback)
    }

    pub fn on_control_change<F: FnMut(&MidiEvent) + 'static>(
        &mut self,
        callback: F,
    ) -> SubscriptionId {
        self.subscribers.control_change.subscribe(callback)
    }

    pub fn on_program_change<F: FnMut(&MidiEvent) + 'static>(
        &mut self,
        callback: F,
    ) -> SubscriptionId {
        self.subscribers.program_change.subscribe(callback)
    }

    pub fn on_pitch_bend<F: FnMut(&MidiEvent) + 'static>(&mut self, callback: F) -> SubscriptionId {
        self.subscribers.pitch_bend.subscribe(callback)
    }

    /// MIDI events of any kind without a dedicated registry.
    pub fn on_generic<F: FnMut(&MidiEvent) + 'static>(&mut self, callback: F) -> SubscriptionId {
        self.subscribers.generic.subscribe(callback)
    }

    pub fn on_system_status<F: FnMut(&Value) + 'static>(&mut self, callback: F) -> SubscriptionId {
        self.subscribers.system_status.subscribe(callback)
    }

    pub fn on_server_info<F: FnMut(&Value) + 'static>(&mut self, callback: F) -> SubscriptionId {
        self.subscribers.server_info.subscribe(callback)
    }

    /// Round-trip time in milliseconds, published for every pong.
    pub fn on_round_trip<F: FnMut(&f64) + 'static>(&mut self, callback: F) -> SubscriptionId {
        self.subscribers.round_trip.subscribe(callback)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.subscribers.unsubscribe(id)
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Start connecting to the configured endpoint.
    ///
    /// Only an unusable endpoint is reported here; a transport that cannot
    /// open enters the reconnect path instead.
    pub fn connect(&mut self) -> Result<(), ChannelError> {
        self.config
            .validate_endpoint()
            .map_err(|reason| ChannelError::InvalidEndpoint {
                url: self.config.url.clone(),
                reason,
            })?;

        if matches!(self.phase, ChannelPhase::Connecting | ChannelPhase::Connected) {
            log::debug!("[ConnectionChannel] connect() ignored, already {:?}", self.phase);
            return Ok(());
        }

        self.cancel_reconnect();
        self.intentional_close = false;
        self.start_attempt();
        Ok(())
    }

    /// Close cleanly (code 1000). No automatic reconnect follows.
    pub fn disconnect(&mut self) {
        self.cancel_reconnect();
        self.intentional_close = true;

        let was_open = matches!(self.phase, ChannelPhase::Connecting | ChannelPhase::Connected);
        self.phase = ChannelPhase::Disconnected;
        self.state.connected = false;

        if was_open {
            self.transport.close(NORMAL_CLOSURE, "Client disconnect");
            log::info!("[ConnectionChannel] Disconnected from {}", self.config.url);
            self.subscribers.disconnected.emit(&Disconnection {
                code: NORMAL_CLOSURE,
                reason: "Client disconnect".to_string(),
            });
        }
    }

    /// Explicit reconnect: resets the attempt counter and leaves `GivenUp`.
    pub fn reconnect(&mut self) -> Result<(), ChannelError> {
        if self.phase == ChannelPhase::Connected {
            return Ok(());
        }
        self.state.reconnect_attempts = 0;
        if self.phase == ChannelPhase::GivenUp {
            self.phase = ChannelPhase::Disconnected;
        }
        if self.phase == ChannelPhase::Connecting {
            // Abandon the in-flight attempt so its outcome cannot count twice.
            self.transport.close(NORMAL_CLOSURE, "Reconnect requested");
            self.phase = ChannelPhase::Disconnected;
        }
        self.connect()
    }

    fn start_attempt(&mut self) {
        self.phase = ChannelPhase::Connecting;
        log::info!("[ConnectionChannel] Connecting to {}", self.config.url);

        if let Err(err) = self.transport.open(&self.config.url) {
            log_channel_error(&err, "open");
            let reason = err.message();
            self.subscribers.error.emit(&err);
            self.connection_lost(ABNORMAL_CLOSURE, reason);
        }
    }

    fn cancel_reconnect(&mut self) {
        if let Some(handle) = self.reconnect_handle.take() {
            self.timers.cancel(handle);
        }
    }

    fn connection_lost(&mut self, code: u16, reason: String) {
        self.state.connected = false;
        self.phase = ChannelPhase::Disconnected;

        log::info!(
            "[ConnectionChannel] Connection closed (code={}, reason={:?})",
            code,
            reason
        );
        self.subscribers
            .disconnected
            .emit(&Disconnection { code, reason });

        if code != NORMAL_CLOSURE && !self.intentional_close {
            self.schedule_reconnect();
        }
    }

    fn schedule_reconnect(&mut self) {
        let max = self.config.max_reconnect_attempts;
        if self.state.reconnect_attempts >= max {
            if self.phase != ChannelPhase::GivenUp {
                self.phase = ChannelPhase::GivenUp;
                log_channel_error(
                    &ChannelError::ReconnectExhausted {
                        attempts: self.state.reconnect_attempts,
                    },
                    "schedule_reconnect",
                );
                self.subscribers
                    .max_reconnect_attempts
                    .emit(&self.state.reconnect_attempts);
            }
            return;
        }

        self.state.reconnect_attempts += 1;
        let attempt = self.state.reconnect_attempts;
        let delay_ms = backoff_delay(self.config.reconnect_delay, attempt);

        self.cancel_reconnect();
        let now = self.clock.now_ms();
        self.reconnect_handle = Some(self.timers.schedule(now, delay_ms, ChannelTask::Reconnect));

        log::info!(
            "[ConnectionChannel] Reconnect attempt {}/{} in {}ms",
            attempt,
            max,
            delay_ms
        );
        self.subscribers
            .reconnecting
            .emit(&ReconnectScheduled { attempt, delay_ms });
    }

    /// Run every deferred task that is due at the current time.
    pub fn fire_due_timers(&mut self) {
        let now = self.clock.now_ms();
        for (handle, task) in self.timers.take_due(now) {
            match task {
                ChannelTask::Reconnect => {
                    if self.reconnect_handle != Some(handle) {
                        continue;
                    }
                    self.reconnect_handle = None;
                    if self.phase == ChannelPhase::Disconnected && !self.intentional_close {
                        self.start_attempt();
                    }
                }
            }
        }
    }

    pub fn next_deadline(&self) -> Option<f64> {
        self.timers.next_deadline()
    }

    // ------------------------------------------------------------------
    // Transport events
    // ------------------------------------------------------------------

    pub fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Opened => self.handle_open(),
            TransportEvent::Text(text) => self.handle_text(&text),
            TransportEvent::Closed { code, reason } => self.handle_close(code, &reason),
            TransportEvent::Error(reason) => self.handle_error(&reason),
        }
    }

    pub fn handle_open(&mut self) {
        if self.phase != ChannelPhase::Connecting {
            log::debug!("[ConnectionChannel] Ignoring open while {:?}", self.phase);
            return;
        }

        self.phase = ChannelPhase::Connected;
        self.state.connected = true;
        self.state.reconnect_attempts = 0;
        log::info!("[ConnectionChannel] Connected to {}", self.config.url);

        self.subscribers.connected.emit(&());
        self.flush_queue();
    }

    pub fn handle_close(&mut self, code: u16, reason: &str) {
        if matches!(self.phase, ChannelPhase::Disconnected | ChannelPhase::GivenUp) {
            return;
        }
        self.connection_lost(code, reason.to_string());
    }

    pub fn handle_error(&mut self, reason: &str) {
        let err = ChannelError::TransportFailure {
            reason: reason.to_string(),
        };
        log_channel_error(&err, "transport");
        self.subscribers.error.emit(&err);

        if matches!(self.phase, ChannelPhase::Disconnected | ChannelPhase::GivenUp) {
            return;
        }
        self.transport.close(INTERNAL_ERROR_CLOSURE, reason);
        self.connection_lost(ABNORMAL_CLOSURE, reason.to_string());
    }

    pub fn handle_text(&mut self, text: &str) {
        let arrival = self.clock.now_ms();

        let envelope = match Envelope::parse(text) {
            Ok(envelope) => envelope,
            Err(err) => {
                log::warn!("[ConnectionChannel] Dropping frame: {}", err.message());
                return;
            }
        };

        // A pong's timestamp is our own send time, not a sender clock.
        if envelope.kind != "pong" {
            if let Some(sent) = envelope.sender_timestamp {
                self.state.latency.observe(arrival - sent);
            }
        }

        let message = match envelope.into_message(arrival) {
            Ok(message) => message,
            Err(err) => {
                log::warn!("[ConnectionChannel] Dropping message: {}", err.message());
                return;
            }
        };

        match message {
            InboundMessage::MidiEvent(event) => self.dispatch_midi(&event),
            InboundMessage::SystemStatus(status) => {
                self.subscribers.system_status.emit(&status);
            }
            InboundMessage::ServerInfo(info) => {
                log::info!("[ConnectionChannel] Server info: {}", info);
                self.subscribers.server_info.emit(&info);
            }
            InboundMessage::Ping { timestamp } => {
                let pong = OutboundMessage::Pong {
                    timestamp,
                    client_time: self.clock.now_ms(),
                };
                if let Err(err) = self.send(&pong) {
                    log_channel_error(&err, "pong");
                }
            }
            InboundMessage::Pong { timestamp, .. } => {
                let rtt = (arrival - timestamp).max(0.0);
                log::debug!("[ConnectionChannel] Round trip {:.1}ms", rtt);
                self.subscribers.round_trip.emit(&rtt);
            }
            InboundMessage::Unknown { kind } => {
                log::debug!("[ConnectionChannel] Unknown message type: {}", kind);
            }
        }
    }

    fn dispatch_midi(&mut self, event: &MidiEvent) {
        self.subscribers.midi_event.emit(event);
        let typed = match event.kind {
            MidiEventKind::NoteOn => &mut self.subscribers.note_on,
            MidiEventKind::NoteOff => &mut self.subscribers.note_off,
            MidiEventKind::ControlChange => &mut self.subscribers.control_change,
            MidiEventKind::ProgramChange => &mut self.subscribers.program_change,
            MidiEventKind::PitchBend => &mut self.subscribers.pitch_bend,
            MidiEventKind::Other(_) => &mut self.subscribers.generic,
        };
        typed.emit(event);
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    /// Serialize and transmit, or queue until the next successful open.
    ///
    /// Only a serialization failure is returned; transport failures are
    /// handled as a lost connection with the message kept queued.
    pub fn send<M: Serialize>(&mut self, message: &M) -> Result<(), ChannelError> {
        let text = serde_json::to_string(message)?;
        self.send_text(text);
        Ok(())
    }

    fn send_text(&mut self, text: String) {
        if !self.state.connected {
            self.state.outgoing.push_back(text);
            return;
        }
        if let Err(err) = self.transport.send(&text) {
            self.state.outgoing.push_back(text);
            self.send_failed(err);
        }
    }

    fn flush_queue(&mut self) {
        while let Some(text) = self.state.outgoing.pop_front() {
            if !self.state.connected {
                self.state.outgoing.push_front(text);
                return;
            }
            if let Err(err) = self.transport.send(&text) {
                self.state.outgoing.push_front(text);
                self.send_failed(err);
                return;
            }
        }
    }

    fn send_failed(&mut self, err: ChannelError) {
        log_channel_error(&err, "send");
        let reason = err.message();
        self.subscribers.error.emit(&err);
        self.transport.close(INTERNAL_ERROR_CLOSURE, &reason);
        self.connection_lost(ABNORMAL_CLOSURE, reason);
    }

    /// Send a ping stamped with the current local time.
    pub fn ping(&mut self) -> Result<(), ChannelError> {
        let timestamp = self.clock.now_ms();
        self.send(&OutboundMessage::Ping { timestamp })
    }

    /// Ask the source for a system-status snapshot.
    pub fn request_status(&mut self) -> Result<(), ChannelError> {
        let timestamp = self.clock.now_ms();
        self.send(&OutboundMessage::RequestSystemStatus { timestamp })
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn phase(&self) -> ChannelPhase {
        self.phase
    }

    pub fn is_connected(&self) -> bool {
        self.state.connected
    }

    pub fn state(&self) -> &ChannelState {
        &self.state
    }

    pub fn queued_messages(&self) -> usize {
        self.state.outgoing.len()
    }

    pub fn latency_stats(&self) -> LatencyStats {
        self.state.latency.stats()
    }

    pub fn summary(&self) -> ConnectionSummary {
        ConnectionSummary {
            connected: self.state.connected,
            phase: self.phase,
            queued_messages: self.state.outgoing.len(),
            reconnect_attempts: self.state.reconnect_attempts,
        }
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }
}

/// `base * 2^(attempt-1)`, with `attempt` starting at 1.
pub fn backoff_delay(base_ms: u64, attempt: u32) -> f64 {
    let exponent = attempt.saturating_sub(1).min(30) as i32;
    base_ms as f64 * 2f64.powi(exponent)
}
