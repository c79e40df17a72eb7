//! Visualization coordinator.
//!
//! Connects the [`ConnectionChannel`] to a [`RendererSurface`]: note events
//! press and release keys, releases fade out over `fadeOutTime` through
//! cancellable completion tasks, and a 1 s report tick turns frame timing,
//! event latency and channel statistics into a [`PerformanceSnapshot`].
//! Simplified lifecycle events are forwarded to application listeners and
//! mirrored on a tokio broadcast channel.
//!
//! # Time
//! Nothing here sleeps. Fade completions, frames and reports are tasks in a
//! [`DeferredQueue`]; the owner calls [`Visualizer::fire_due`] whenever
//! [`Visualizer::next_deadline`] has passed. The runtime driver does that
//! from its event loop, tests do it with a [`crate::scheduler::ManualClock`].
//!
//! # Ownership
//! The channel is owned directly. Everything the channel's subscriber
//! callbacks touch lives in a shared `CoordinatorCore`, which never reaches
//! back into the channel, so channel dispatch cannot re-enter itself.

use std::cell::{Ref, RefCell};
use std::collections::BTreeSet;
use std::rc::Rc;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::channel::{ConnectionChannel, MidiEvent, Transport, TransportEvent};
use crate::config::{AppConfig, SurfaceConfig, VisualizerConfig};
use crate::error::{log_init_error, ChannelError, ErrorCode, InitError, InitStage};
use crate::renderer::{is_midi_note, RendererSurface};
use crate::scheduler::{DeferredQueue, TaskHandle, TimeSource};
use crate::subscribers::{SubscriptionId, Subscribers};
use crate::telemetry::{
    ConnectionSummary, FrameMeter, LatencyStats, PerformanceSnapshot, SmoothedLatency,
    FRAME_DROP_RATIO,
};

pub mod animation;
pub mod events;

#[cfg(test)]
mod tests;

pub use animation::{AnimationTable, FadeStart, KeyAnimation};
pub use events::{HostEvent, VisualizerEvent};

/// Interval between performance reports.
pub const REPORT_INTERVAL_MS: f64 = 1000.0;

/// Buffered application events per broadcast receiver.
const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Created,
    Running,
    Failed,
    ShutDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CoordinatorTask {
    FadeComplete { note: i32 },
    Frame,
    Report,
}

struct CoordinatorCore<R> {
    config: VisualizerConfig,
    renderer: R,
    clock: Rc<dyn TimeSource>,
    animations: AnimationTable,
    lit: BTreeSet<i32>,
    tasks: DeferredQueue<CoordinatorTask>,
    frame_handle: Option<TaskHandle>,
    report_handle: Option<TaskHandle>,
    frames: FrameMeter,
    latency: SmoothedLatency,
    context_lost: bool,
    surface: (u32, u32),
    last_snapshot: Option<PerformanceSnapshot>,
    listeners: Subscribers<VisualizerEvent>,
    events_tx: broadcast::Sender<VisualizerEvent>,
}

impl<R: RendererSurface> CoordinatorCore<R> {
    fn emit(&mut self, event: VisualizerEvent) {
        self.listeners.emit(&event);
        // No receivers is fine; callbacks are the primary delivery path.
        let _ = self.events_tx.send(event);
    }

    fn playable(note: i32) -> bool {
        if !is_midi_note(note) {
            log::debug!("[Visualizer] Ignoring note {} outside 0-127", note);
            return false;
        }
        true
    }

    fn press_key(&mut self, note: i32, velocity: u8) {
        self.renderer.key_down(note, velocity);
        self.lit.insert(note);
    }

    fn release_key(&mut self, note: i32) {
        self.renderer.key_up(note);
        self.lit.remove(&note);
    }

    fn note_on(&mut self, event: &MidiEvent) {
        let Some(note) = event.note.filter(|note| Self::playable(*note)) else {
            return;
        };
        let now = self.clock.now_ms();
        let velocity = event.velocity_or_default();
        let latency = now - event.timestamp;
        self.latency.observe(latency);

        if latency > self.config.max_latency {
            log::warn!(
                "[Visualizer] High latency {:.1}ms on note {} (limit {}ms)",
                latency,
                note,
                self.config.max_latency
            );
            self.emit(VisualizerEvent::HighLatency {
                latency,
                event: event.clone(),
            });
        }

        self.press_key(note, velocity);

        if self.config.enable_smooth_transitions {
            if let Some(stale) = self.animations.press(note, now) {
                if let Some(handle) = stale.pending {
                    self.tasks.cancel(handle);
                }
            }
        }

        self.emit(VisualizerEvent::NoteOn {
            note,
            velocity,
            latency,
        });
    }

    fn note_off(&mut self, event: &MidiEvent) {
        let Some(note) = event.note.filter(|note| Self::playable(*note)) else {
            return;
        };
        let now = self.clock.now_ms();
        let latency = now - event.timestamp;

        if !self.config.enable_smooth_transitions {
            self.release_key(note);
        } else {
            match self.animations.begin_fade(note, now) {
                FadeStart::Started => {
                    let handle = self.tasks.schedule(
                        now,
                        self.config.fade_out_time,
                        CoordinatorTask::FadeComplete { note },
                    );
                    self.animations.attach_completion(note, handle);
                }
                FadeStart::AlreadyFading => {
                    log::debug!("[Visualizer] Duplicate note_off for fading note {}", note);
                }
                FadeStart::Missing => self.release_key(note),
            }
        }

        self.emit(VisualizerEvent::NoteOff { note, latency });
    }

    fn complete_fade(&mut self, note: i32, handle: TaskHandle) {
        if self.animations.complete(note, Some(handle)).is_some() {
            self.release_key(note);
        }
    }

    fn frame_interval_ms(&self) -> f64 {
        1000.0 / self.config.target_fps
    }

    fn frame(&mut self, now: f64) {
        self.frame_handle = None;
        self.frames.record_frame(now, self.config.target_fps);

        for note in self
            .animations
            .expired(now, self.config.fade_out_time)
        {
            if let Some(finished) = self.animations.complete(note, None) {
                if let Some(handle) = finished.pending {
                    self.tasks.cancel(handle);
                }
                self.release_key(note);
            }
        }

        if !self.context_lost {
            self.renderer.render_frame(now);
        }

        let interval = self.frame_interval_ms();
        self.frame_handle = Some(self.tasks.schedule(now, interval, CoordinatorTask::Frame));
    }

    fn snapshot(
        &self,
        now: f64,
        latency: LatencyStats,
        connection: ConnectionSummary,
    ) -> PerformanceSnapshot {
        PerformanceSnapshot {
            timestamp_ms: now,
            frame_rate: self.renderer.frame_rate(),
            average_latency_ms: self.latency.value(),
            frame_drops: self.frames.frame_drops(),
            active_keys: self.lit.len(),
            latency,
            connection,
        }
    }

    fn report(&mut self, now: f64, latency: LatencyStats, connection: ConnectionSummary) {
        self.report_handle = Some(self.tasks.schedule(
            now,
            REPORT_INTERVAL_MS,
            CoordinatorTask::Report,
        ));

        let snapshot = self.snapshot(now, latency, connection);
        let min_fps = self.config.target_fps * FRAME_DROP_RATIO;
        if snapshot.frame_rate < min_fps {
            log::warn!(
                "[Visualizer] Low frame rate: {:.1} fps (target {})",
                snapshot.frame_rate,
                self.config.target_fps
            );
        }
        if snapshot.average_latency_ms > self.config.max_latency {
            log::warn!(
                "[Visualizer] High average latency: {:.1}ms (limit {}ms)",
                snapshot.average_latency_ms,
                self.config.max_latency
            );
        }

        self.last_snapshot = Some(snapshot.clone());
        self.emit(VisualizerEvent::PerformanceUpdate { snapshot });
    }

    fn stop_loops(&mut self) {
        if let Some(handle) = self.frame_handle.take() {
            self.tasks.cancel(handle);
        }
        if let Some(handle) = self.report_handle.take() {
            self.tasks.cancel(handle);
        }
    }

    /// Drop every animation and pending task without releasing keys.
    fn teardown(&mut self) {
        self.stop_loops();
        for animation in self.animations.drain() {
            if let Some(handle) = animation.pending {
                self.tasks.cancel(handle);
            }
        }
        self.tasks.clear();
    }
}

/// Coordinates the connection channel, renderer and animation state.
pub struct Visualizer<R: RendererSurface + 'static, T: Transport> {
    surface: SurfaceConfig,
    channel: ConnectionChannel<T>,
    core: Rc<RefCell<CoordinatorCore<R>>>,
    clock: Rc<dyn TimeSource>,
    lifecycle: Lifecycle,
    bindings: Vec<SubscriptionId>,
}

impl<R: RendererSurface + 'static, T: Transport> Visualizer<R, T> {
    pub fn new(config: &AppConfig, renderer: R, transport: T, clock: Rc<dyn TimeSource>) -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_BUFFER);
        let core = CoordinatorCore {
            config: config.visualizer.clone(),
            renderer,
            clock: Rc::clone(&clock),
            animations: AnimationTable::new(),
            lit: BTreeSet::new(),
            tasks: DeferredQueue::new(),
            frame_handle: None,
            report_handle: None,
            frames: FrameMeter::new(),
            latency: SmoothedLatency::default(),
            context_lost: false,
            surface: (config.surface.width, config.surface.height),
            last_snapshot: None,
            listeners: Subscribers::new("visualizer"),
            events_tx,
        };

        Self {
            surface: config.surface.clone(),
            channel: ConnectionChannel::new(config.channel.clone(), transport, Rc::clone(&clock)),
            core: Rc::new(RefCell::new(core)),
            clock,
            lifecycle: Lifecycle::Created,
            bindings: Vec::new(),
        }
    }

    // ========================================================================
    // LIFECYCLE
    // ========================================================================

    /// Run the initialization sequence.
    ///
    /// Stages run in order (renderer, connection, host events, telemetry,
    /// animation loop). The first failure rolls back what earlier stages set
    /// up, emits `error` naming the stage and is returned; nothing is left
    /// half-started. Emits `initialized` on success.
    pub fn initialize(&mut self) -> Result<(), InitError> {
        if self.lifecycle == Lifecycle::Running {
            return Ok(());
        }

        match self.run_stages() {
            Ok(()) => {
                self.lifecycle = Lifecycle::Running;
                log::info!("[Visualizer] Initialized");
                self.core.borrow_mut().emit(VisualizerEvent::Initialized);
                Ok(())
            }
            Err(err) => {
                log_init_error(&err);
                self.rollback();
                self.lifecycle = Lifecycle::Failed;
                self.core.borrow_mut().emit(VisualizerEvent::Error {
                    stage: Some(err.stage),
                    message: err.message(),
                });
                Err(err)
            }
        }
    }

    fn run_stages(&mut self) -> Result<(), InitError> {
        self.core
            .borrow_mut()
            .renderer
            .initialize()
            .map_err(|err| InitError::new(InitStage::Renderer, err.message()))?;

        self.bind_channel();
        self.channel
            .connect()
            .map_err(|err| InitError::new(InitStage::Connection, err.message()))?;

        let now = self.clock.now_ms();
        let mut core = self.core.borrow_mut();

        let (width, height) = core.surface;
        core.renderer
            .resize(width, height)
            .map_err(|err| InitError::new(InitStage::HostEvents, err.message()))?;

        if !core.config.max_latency.is_finite() || core.config.max_latency < 0.0 {
            return Err(InitError::new(
                InitStage::Telemetry,
                format!("maxLatency must be a non-negative number, got {}", core.config.max_latency),
            ));
        }
        if core.config.enable_performance_monitoring {
            core.report_handle =
                Some(core.tasks.schedule(now, REPORT_INTERVAL_MS, CoordinatorTask::Report));
        }

        let fps = core.config.target_fps;
        if !fps.is_finite() || fps <= 0.0 {
            return Err(InitError::new(
                InitStage::AnimationLoop,
                format!("targetFPS must be positive, got {}", fps),
            ));
        }
        if !core.config.fade_out_time.is_finite() || core.config.fade_out_time < 0.0 {
            return Err(InitError::new(
                InitStage::AnimationLoop,
                format!("fadeOutTime must not be negative, got {}", core.config.fade_out_time),
            ));
        }
        core.frame_handle = Some(core.tasks.schedule(now, 0.0, CoordinatorTask::Frame));
        Ok(())
    }

    fn bind_channel(&mut self) {
        let core = Rc::clone(&self.core);
        self.bindings
            .push(self.channel.on_note_on(move |event| core.borrow_mut().note_on(event)));

        let core = Rc::clone(&self.core);
        self.bindings
            .push(self.channel.on_note_off(move |event| core.borrow_mut().note_off(event)));

        let core = Rc::clone(&self.core);
        self.bindings.push(self.channel.on_connected(move |_| {
            core.borrow_mut().emit(VisualizerEvent::MidiConnected);
        }));

        let core = Rc::clone(&self.core);
        self.bindings.push(self.channel.on_disconnected(move |closed| {
            core.borrow_mut().emit(VisualizerEvent::MidiDisconnected {
                code: closed.code,
                reason: closed.reason.clone(),
            });
        }));

        let core = Rc::clone(&self.core);
        self.bindings.push(self.channel.on_error(move |err| {
            core.borrow_mut().emit(VisualizerEvent::MidiError {
                message: err.message(),
            });
        }));

        let core = Rc::clone(&self.core);
        self.bindings
            .push(self.channel.on_max_reconnect_attempts(move |attempts| {
                let err = ChannelError::ReconnectExhausted {
                    attempts: *attempts,
                };
                core.borrow_mut().emit(VisualizerEvent::MidiError {
                    message: err.message(),
                });
            }));
    }

    fn unbind_channel(&mut self) {
        for id in std::mem::take(&mut self.bindings) {
            self.channel.unsubscribe(id);
        }
    }

    fn rollback(&mut self) {
        self.unbind_channel();
        self.channel.disconnect();
        self.core.borrow_mut().stop_loops();
    }

    /// Stop the loops, close the channel cleanly and drop all animations.
    ///
    /// Pending fades are cancelled without releasing their keys.
    pub fn shutdown(&mut self) {
        if self.lifecycle == Lifecycle::ShutDown {
            return;
        }
        self.channel.disconnect();
        self.unbind_channel();
        self.core.borrow_mut().teardown();
        self.lifecycle = Lifecycle::ShutDown;
        log::info!("[Visualizer] Shut down");
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    // ========================================================================
    // NOTES
    // ========================================================================

    /// Press a key as if a note_on with sender time `origin_ms` arrived now.
    pub fn note_on(&mut self, note: i32, velocity: u8, origin_ms: f64) {
        let mut event = MidiEvent::note_on(0, note, velocity, origin_ms);
        event.arrival = self.clock.now_ms();
        self.core.borrow_mut().note_on(&event);
    }

    /// Release a key as if a note_off with sender time `origin_ms` arrived now.
    pub fn note_off(&mut self, note: i32, origin_ms: f64) {
        let mut event = MidiEvent::note_off(0, note, origin_ms);
        event.arrival = self.clock.now_ms();
        self.core.borrow_mut().note_off(&event);
    }

    // ========================================================================
    // EVENT SOURCES
    // ========================================================================

    pub fn handle_transport_event(&mut self, event: TransportEvent) {
        self.channel.handle_transport_event(event);
    }

    pub fn handle_host_event(&mut self, event: HostEvent) {
        let running = self.lifecycle == Lifecycle::Running;
        let mut core = self.core.borrow_mut();
        match event {
            HostEvent::Resize { width, height } => {
                core.surface = (width, height);
                if !running || core.context_lost {
                    return;
                }
                if let Err(err) = core.renderer.resize(width, height) {
                    log::warn!("[Visualizer] Resize failed: {}", err.message());
                    core.emit(VisualizerEvent::Error {
                        stage: None,
                        message: err.message(),
                    });
                }
            }
            HostEvent::ContextLost => {
                if core.context_lost {
                    return;
                }
                core.context_lost = true;
                log::warn!("[Visualizer] Rendering context lost");
                core.emit(VisualizerEvent::ContextLost);
            }
            HostEvent::ContextRestored => {
                if !core.context_lost {
                    return;
                }
                let (width, height) = core.surface;
                let restored = match core.renderer.initialize() {
                    Ok(()) => core.renderer.resize(width, height),
                    Err(err) => Err(err),
                };
                if let Err(err) = restored {
                    log::error!("[Visualizer] Context restore failed: {}", err.message());
                    core.emit(VisualizerEvent::Error {
                        stage: None,
                        message: err.message(),
                    });
                    return;
                }
                core.context_lost = false;
                core.frames.reset_reference();
                log::info!("[Visualizer] Rendering context restored");
                core.emit(VisualizerEvent::ContextRestored);
            }
        }
    }

    /// Fire every channel timer and coordinator task that is due now.
    pub fn fire_due(&mut self) {
        self.channel.fire_due_timers();

        let now = self.clock.now_ms();
        loop {
            let due = self.core.borrow_mut().tasks.take_due(now);
            if due.is_empty() {
                break;
            }
            for (handle, task) in due {
                match task {
                    CoordinatorTask::FadeComplete { note } => {
                        self.core.borrow_mut().complete_fade(note, handle);
                    }
                    CoordinatorTask::Frame => self.core.borrow_mut().frame(now),
                    CoordinatorTask::Report => {
                        let latency = self.channel.latency_stats();
                        let summary = self.channel.summary();
                        self.core.borrow_mut().report(now, latency, summary);
                    }
                }
            }
        }
    }

    /// Earliest deadline across the channel and the coordinator.
    pub fn next_deadline(&self) -> Option<f64> {
        let core = self.core.borrow().tasks.next_deadline();
        match (core, self.channel.next_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    // ========================================================================
    // LISTENERS
    // ========================================================================

    pub fn subscribe<F>(&mut self, callback: F) -> SubscriptionId
    where
        F: FnMut(&VisualizerEvent) + 'static,
    {
        self.core.borrow_mut().listeners.subscribe(callback)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.core.borrow_mut().listeners.unsubscribe(id)
    }

    pub fn event_receiver(&self) -> broadcast::Receiver<VisualizerEvent> {
        self.core.borrow().events_tx.subscribe()
    }

    pub fn event_stream(&self) -> BroadcastStream<VisualizerEvent> {
        BroadcastStream::new(self.event_receiver())
    }

    /// Sender side of the event mirror, for consumers on other threads.
    pub fn event_sender(&self) -> broadcast::Sender<VisualizerEvent> {
        self.core.borrow().events_tx.clone()
    }

    // ========================================================================
    // INTROSPECTION
    // ========================================================================

    /// Snapshot computed now, without publishing it.
    pub fn snapshot(&self) -> PerformanceSnapshot {
        let now = self.clock.now_ms();
        self.core
            .borrow()
            .snapshot(now, self.channel.latency_stats(), self.channel.summary())
    }

    /// Most recent snapshot published by the report tick.
    pub fn last_snapshot(&self) -> Option<PerformanceSnapshot> {
        self.core.borrow().last_snapshot.clone()
    }

    pub fn active_keys(&self) -> Vec<i32> {
        self.core.borrow().lit.iter().copied().collect()
    }

    pub fn animation(&self, note: i32) -> Option<KeyAnimation> {
        self.core.borrow().animations.get(note).copied()
    }

    pub fn animation_count(&self) -> usize {
        self.core.borrow().animations.len()
    }

    pub fn is_context_lost(&self) -> bool {
        self.core.borrow().context_lost
    }

    pub fn surface_size(&self) -> (u32, u32) {
        self.core.borrow().surface
    }

    pub fn initial_surface(&self) -> &SurfaceConfig {
        &self.surface
    }

    pub fn renderer(&self) -> Ref<'_, R> {
        Ref::map(self.core.borrow(), |core| &core.renderer)
    }

    pub fn channel(&self) -> &ConnectionChannel<T> {
        &self.channel
    }

    pub fn channel_mut(&mut self) -> &mut ConnectionChannel<T> {
        &mut self.channel
    }
}
