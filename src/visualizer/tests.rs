use super::*;
use crate::channel::RecordingTransport;
use crate::error::RendererError;
use crate::scheduler::ManualClock;
use crate::telemetry::ChannelPhase;

const T0: f64 = 1_000_000.0;

#[derive(Debug, Clone, PartialEq)]
enum RenderCall {
    Initialize,
    KeyDown(i32, u8),
    KeyUp(i32),
    Resize(u32, u32),
}

#[derive(Debug, Default)]
struct RenderLog {
    calls: Vec<RenderCall>,
    frames: Vec<f64>,
    fail_initialize: bool,
    fps: f64,
}

/// Renderer double that records every call.
#[derive(Clone, Default)]
struct RecordingRenderer {
    log: Rc<RefCell<RenderLog>>,
}

impl RecordingRenderer {
    fn calls(&self) -> Vec<RenderCall> {
        self.log.borrow().calls.clone()
    }

    fn key_ups(&self, note: i32) -> usize {
        self.calls()
            .iter()
            .filter(|call| **call == RenderCall::KeyUp(note))
            .count()
    }

    fn frames(&self) -> usize {
        self.log.borrow().frames.len()
    }
}

impl RendererSurface for RecordingRenderer {
    fn initialize(&mut self) -> Result<(), RendererError> {
        let mut log = self.log.borrow_mut();
        if log.fail_initialize {
            return Err(RendererError::InitializationFailed {
                reason: "no adapter".into(),
            });
        }
        log.calls.push(RenderCall::Initialize);
        Ok(())
    }

    fn key_down(&mut self, note: i32, velocity: u8) {
        self.log
            .borrow_mut()
            .calls
            .push(RenderCall::KeyDown(note, velocity));
    }

    fn key_up(&mut self, note: i32) {
        self.log.borrow_mut().calls.push(RenderCall::KeyUp(note));
    }

    fn frame_rate(&self) -> f64 {
        self.log.borrow().fps
    }

    fn resize(&mut self, width: u32, height: u32) -> Result<(), RendererError> {
        if width == 0 || height == 0 {
            return Err(RendererError::InvalidSurface { width, height });
        }
        self.log
            .borrow_mut()
            .calls
            .push(RenderCall::Resize(width, height));
        Ok(())
    }

    fn render_frame(&mut self, now_ms: f64) {
        self.log.borrow_mut().frames.push(now_ms);
    }
}

struct Harness {
    clock: ManualClock,
    wire: RecordingTransport,
    renderer: RecordingRenderer,
    events: Rc<RefCell<Vec<VisualizerEvent>>>,
    viz: Visualizer<RecordingRenderer, RecordingTransport>,
}

impl Harness {
    fn new(config: AppConfig) -> Self {
        let clock = ManualClock::new(T0);
        let wire = RecordingTransport::new();
        let renderer = RecordingRenderer::default();
        renderer.log.borrow_mut().fps = 60.0;

        let mut viz = Visualizer::new(
            &config,
            renderer.clone(),
            wire.clone(),
            Rc::new(clock.clone()),
        );
        let events = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&events);
        viz.subscribe(move |event| sink.borrow_mut().push(event.clone()));

        Self {
            clock,
            wire,
            renderer,
            events,
            viz,
        }
    }

    /// Initialized, socket open, first frame drawn.
    fn running(config: AppConfig) -> Self {
        let mut h = Self::new(config);
        h.viz.initialize().unwrap();
        h.viz.handle_transport_event(TransportEvent::Opened);
        h.viz.fire_due();
        h
    }

    fn advance(&mut self, ms: f64) {
        self.clock.advance(ms);
        self.viz.fire_due();
    }

    fn now(&self) -> f64 {
        self.clock.now_ms()
    }

    fn event_names(&self) -> Vec<&'static str> {
        self.events.borrow().iter().map(VisualizerEvent::name).collect()
    }
}

fn midi_frame(payload: serde_json::Value) -> TransportEvent {
    TransportEvent::Text(serde_json::json!({"type": "midi_event", "payload": payload}).to_string())
}

// ----------------------------------------------------------------------------
// Initialization
// ----------------------------------------------------------------------------

#[test]
fn test_initialize_runs_all_stages() {
    let mut h = Harness::new(AppConfig::default());
    h.viz.initialize().unwrap();

    assert_eq!(h.viz.lifecycle(), Lifecycle::Running);
    assert_eq!(
        h.renderer.calls(),
        vec![RenderCall::Initialize, RenderCall::Resize(1280, 720)]
    );
    assert_eq!(h.viz.channel().phase(), ChannelPhase::Connecting);
    assert_eq!(h.wire.opened().len(), 1);
    assert_eq!(h.event_names(), vec!["initialized"]);
    // First frame is armed immediately
    assert_eq!(h.viz.next_deadline(), Some(T0));
}

#[test]
fn test_renderer_failure_stops_before_connecting() {
    let mut h = Harness::new(AppConfig::default());
    h.renderer.log.borrow_mut().fail_initialize = true;

    let err = h.viz.initialize().unwrap_err();
    assert_eq!(err.stage, InitStage::Renderer);
    assert!(h.wire.opened().is_empty());
    assert_eq!(h.viz.lifecycle(), Lifecycle::Failed);

    let events = h.events.borrow();
    assert_eq!(events.len(), 1);
    assert!(matches!(
        &events[0],
        VisualizerEvent::Error {
            stage: Some(InitStage::Renderer),
            ..
        }
    ));
}

#[test]
fn test_bad_endpoint_fails_connection_stage() {
    let mut config = AppConfig::default();
    config.channel.url = "localhost:8765".into();
    let mut h = Harness::new(config);

    let err = h.viz.initialize().unwrap_err();
    assert_eq!(err.stage, InitStage::Connection);
    assert!(h.wire.opened().is_empty());
    assert_eq!(h.viz.next_deadline(), None);
}

#[test]
fn test_late_stage_failure_rolls_back_connection() {
    let mut config = AppConfig::default();
    config.visualizer.target_fps = 0.0;
    let mut h = Harness::new(config);

    let err = h.viz.initialize().unwrap_err();
    assert_eq!(err.stage, InitStage::AnimationLoop);
    assert_eq!(h.wire.closed(), vec![(1000, "Client disconnect".to_string())]);
    assert_eq!(h.viz.channel().phase(), ChannelPhase::Disconnected);
    assert_eq!(h.viz.next_deadline(), None, "report timer cancelled");
    // Bindings were removed before the rollback closed the socket
    assert_eq!(h.event_names(), vec!["error"]);
}

// ----------------------------------------------------------------------------
// Notes and fades
// ----------------------------------------------------------------------------

#[test]
fn test_key_stays_lit_until_note_off_then_fades() {
    let mut h = Harness::running(AppConfig::default());
    h.viz.note_on(60, 100, h.now());
    assert!(h.renderer.calls().contains(&RenderCall::KeyDown(60, 100)));

    h.advance(800.0);
    assert_eq!(h.renderer.key_ups(60), 0);
    assert_eq!(h.viz.active_keys(), vec![60]);

    h.viz.note_off(60, h.now());
    assert!(h.viz.animation(60).unwrap().is_fading());

    h.advance(499.0);
    assert_eq!(h.renderer.key_ups(60), 0);

    h.advance(1.0);
    assert_eq!(h.renderer.key_ups(60), 1);
    assert!(h.viz.active_keys().is_empty());
    assert_eq!(h.viz.animation_count(), 0);
}

#[test]
fn test_fade_completion_releases_key_once() {
    let mut h = Harness::running(AppConfig::default());
    h.viz.note_on(62, 80, h.now());
    h.viz.note_off(62, h.now());

    // Frame sweep and completion task are due together
    h.advance(500.0);
    h.advance(0.0);
    h.advance(500.0);
    assert_eq!(h.renderer.key_ups(62), 1);
}

#[test]
fn test_note_on_during_fade_cancels_stale_completion() {
    let mut h = Harness::running(AppConfig::default());
    h.viz.note_on(64, 90, h.now());
    h.viz.note_off(64, h.now());

    h.advance(300.0);
    h.viz.note_on(64, 70, h.now());
    h.advance(400.0);

    assert_eq!(h.renderer.key_ups(64), 0, "key never goes off then on");
    assert!(!h.viz.animation(64).unwrap().is_fading());
    assert_eq!(h.viz.active_keys(), vec![64]);
}

#[test]
fn test_duplicate_note_off_keeps_original_fade() {
    let mut h = Harness::running(AppConfig::default());
    h.viz.note_on(65, 90, h.now());
    h.viz.note_off(65, h.now());
    let fade_start = h.viz.animation(65).unwrap().fade_start;

    h.advance(200.0);
    h.viz.note_off(65, h.now());
    assert_eq!(h.viz.animation(65).unwrap().fade_start, fade_start);

    h.advance(300.0);
    assert_eq!(h.renderer.key_ups(65), 1);
}

#[test]
fn test_note_off_without_record_releases_immediately() {
    let mut h = Harness::running(AppConfig::default());
    h.viz.note_off(67, h.now());
    assert_eq!(h.renderer.key_ups(67), 1);
    assert_eq!(h.viz.animation_count(), 0);
}

#[test]
fn test_out_of_range_notes_are_ignored() {
    let mut h = Harness::running(AppConfig::default());
    h.events.borrow_mut().clear();

    for note in [200, -5, 1_000_000] {
        h.viz.note_on(note, 100, h.now());
    }
    h.viz.note_off(128, h.now());
    h.advance(1000.0);

    assert!(h.viz.active_keys().is_empty());
    assert_eq!(h.viz.animation_count(), 0);
    assert_eq!(h.viz.snapshot().active_keys, 0);
    assert!(!h
        .renderer
        .calls()
        .iter()
        .any(|call| matches!(call, RenderCall::KeyDown(..) | RenderCall::KeyUp(_))));
    assert!(!h
        .event_names()
        .iter()
        .any(|name| *name == "note_on" || *name == "note_off"));
}

#[test]
fn test_without_smooth_transitions_release_is_immediate() {
    let mut config = AppConfig::default();
    config.visualizer.enable_smooth_transitions = false;
    let mut h = Harness::running(config);

    h.viz.note_on(60, 100, h.now());
    assert_eq!(h.viz.animation_count(), 0);
    h.viz.note_off(60, h.now());
    assert_eq!(h.renderer.key_ups(60), 1);
    assert!(h.viz.active_keys().is_empty());
}

// ----------------------------------------------------------------------------
// Latency
// ----------------------------------------------------------------------------

#[test]
fn test_high_latency_is_reported_independently() {
    let mut h = Harness::running(AppConfig::default());
    h.events.borrow_mut().clear();

    h.viz.note_on(60, 100, h.now() - 80.0);
    h.viz.note_on(61, 100, h.now() - 10.0);

    assert_eq!(
        h.event_names(),
        vec!["high_latency", "note_on", "note_on"]
    );
    let events = h.events.borrow();
    let VisualizerEvent::HighLatency { latency, event } = &events[0] else {
        panic!("expected high_latency");
    };
    assert_eq!(*latency, 80.0);
    assert_eq!(event.note, Some(60));
    assert_eq!(
        events[2],
        VisualizerEvent::NoteOn {
            note: 61,
            velocity: 100,
            latency: 10.0
        }
    );
    // The late note still fades normally
    assert!(h.viz.animation(60).is_some());
}

#[test]
fn test_smoothed_latency_seeds_then_weights() {
    let mut h = Harness::running(AppConfig::default());
    h.viz.note_on(60, 100, h.now() - 100.0);
    assert_eq!(h.viz.snapshot().average_latency_ms, 100.0);

    h.viz.note_on(61, 100, h.now() - 200.0);
    assert!((h.viz.snapshot().average_latency_ms - 110.0).abs() < 1e-9);

    // note_off latency is reported but not folded in
    h.viz.note_off(60, h.now() - 1000.0);
    assert!((h.viz.snapshot().average_latency_ms - 110.0).abs() < 1e-9);
}

// ----------------------------------------------------------------------------
// Frames and reporting
// ----------------------------------------------------------------------------

#[test]
fn test_frames_count_drops_below_target() {
    let mut h = Harness::running(AppConfig::default());
    for _ in 0..5 {
        h.advance(1000.0 / 60.0);
    }
    assert_eq!(h.viz.snapshot().frame_drops, 0);
    assert_eq!(h.renderer.frames(), 6);

    h.advance(100.0);
    assert_eq!(h.viz.snapshot().frame_drops, 1);
}

#[test]
fn test_report_publishes_snapshot_every_second() {
    let mut h = Harness::running(AppConfig::default());
    h.viz.channel_mut().ping().unwrap();
    h.viz.note_on(60, 100, h.now());
    h.viz.handle_transport_event(TransportEvent::Text(
        serde_json::json!({"type": "system_status", "timestamp": h.now() - 6.0}).to_string(),
    ));

    h.advance(999.0);
    assert!(h.viz.last_snapshot().is_none());
    h.advance(1.0);

    let snapshot = h.viz.last_snapshot().unwrap();
    assert_eq!(snapshot.timestamp_ms, T0 + 1000.0);
    assert_eq!(snapshot.frame_rate, 60.0);
    assert_eq!(snapshot.active_keys, 1);
    assert_eq!(snapshot.latency.sample_count, 1);
    assert!(snapshot.connection.connected);
    assert_eq!(snapshot.connection.queued_messages, 0);
    assert_eq!(
        h.event_names().iter().filter(|name| **name == "performance_update").count(),
        1
    );

    h.advance(1000.0);
    assert_eq!(
        h.event_names().iter().filter(|name| **name == "performance_update").count(),
        2
    );
}

#[test]
fn test_monitoring_disabled_skips_reports() {
    let mut config = AppConfig::default();
    config.visualizer.enable_performance_monitoring = false;
    let mut h = Harness::running(config);
    h.advance(5000.0);
    assert!(h.viz.last_snapshot().is_none());
}

// ----------------------------------------------------------------------------
// Channel integration
// ----------------------------------------------------------------------------

#[test]
fn test_channel_events_drive_keys_and_app_events() {
    let mut h = Harness::new(AppConfig::default());
    h.viz.initialize().unwrap();
    h.viz.handle_transport_event(TransportEvent::Opened);

    h.viz.handle_transport_event(midi_frame(serde_json::json!({
        "type": "note_on", "channel": 0, "note": 60, "velocity": 90, "timestamp": T0 - 5.0
    })));
    h.viz.handle_transport_event(midi_frame(serde_json::json!({
        "type": "note_on", "channel": 0, "note": 61, "velocity": 0, "timestamp": T0
    })));
    h.viz.handle_transport_event(TransportEvent::Closed {
        code: 1006,
        reason: "network".into(),
    });

    assert!(h.renderer.calls().contains(&RenderCall::KeyDown(60, 90)));
    assert_eq!(h.renderer.key_ups(61), 1, "velocity 0 note_on releases");
    assert_eq!(
        h.event_names(),
        vec![
            "initialized",
            "midi_connected",
            "note_on",
            "note_off",
            "midi_disconnected"
        ]
    );
    assert_eq!(h.viz.channel().summary().reconnect_attempts, 1);
}

#[test]
fn test_exhaustion_surfaces_as_midi_error() {
    let mut config = AppConfig::default();
    config.channel.max_reconnect_attempts = 0;
    let mut h = Harness::new(config);
    h.viz.initialize().unwrap();

    h.viz.handle_transport_event(TransportEvent::Closed {
        code: 1006,
        reason: "refused".into(),
    });
    assert_eq!(h.viz.channel().phase(), ChannelPhase::GivenUp);
    assert!(h.event_names().contains(&"midi_error"));
}

// ----------------------------------------------------------------------------
// Host events
// ----------------------------------------------------------------------------

#[test]
fn test_context_loss_suppresses_drawing_only() {
    let mut h = Harness::running(AppConfig::default());
    assert_eq!(h.renderer.frames(), 1);
    h.viz.note_on(60, 100, h.now());
    h.viz.note_off(60, h.now());

    h.viz.handle_host_event(HostEvent::ContextLost);
    assert!(h.viz.is_context_lost());
    h.advance(20.0);
    assert_eq!(h.renderer.frames(), 1);
    assert!(h.viz.animation(60).is_some(), "animations untouched");

    h.viz.handle_host_event(HostEvent::Resize {
        width: 800,
        height: 600,
    });
    h.viz.handle_host_event(HostEvent::ContextRestored);
    let calls = h.renderer.calls();
    assert_eq!(
        calls[calls.len() - 2..],
        [RenderCall::Initialize, RenderCall::Resize(800, 600)]
    );

    h.advance(20.0);
    assert_eq!(h.renderer.frames(), 2);
    assert!(h.viz.channel().is_connected());

    let names = h.event_names();
    assert!(names.contains(&"context_lost") && names.contains(&"context_restored"));
}

#[test]
fn test_invalid_resize_reports_error() {
    let mut h = Harness::running(AppConfig::default());
    h.viz.handle_host_event(HostEvent::Resize {
        width: 0,
        height: 10,
    });
    let events = h.events.borrow();
    assert!(matches!(
        events.last(),
        Some(VisualizerEvent::Error { stage: None, .. })
    ));
}

// ----------------------------------------------------------------------------
// Teardown and listeners
// ----------------------------------------------------------------------------

#[test]
fn test_shutdown_discards_animations_without_release() {
    let mut h = Harness::running(AppConfig::default());
    h.viz.note_on(60, 100, h.now());
    h.viz.note_off(60, h.now());

    h.viz.shutdown();
    assert_eq!(h.viz.lifecycle(), Lifecycle::ShutDown);
    assert_eq!(h.viz.animation_count(), 0);
    assert_eq!(h.viz.next_deadline(), None);
    assert_eq!(h.wire.closed(), vec![(1000, "Client disconnect".to_string())]);
    assert_eq!(h.event_names().last(), Some(&"midi_disconnected"));

    h.advance(1000.0);
    assert_eq!(h.renderer.key_ups(60), 0);

    // No auto-reconnect after a clean close
    h.viz.handle_transport_event(TransportEvent::Closed {
        code: 1006,
        reason: "late".into(),
    });
    assert_eq!(h.viz.next_deadline(), None);
}

#[test]
fn test_failing_listener_is_isolated() {
    let mut h = Harness::running(AppConfig::default());
    h.viz.subscribe(|_| panic!("listener bug"));
    h.events.borrow_mut().clear();

    h.viz.note_on(60, 100, h.now());
    assert_eq!(h.event_names(), vec!["note_on"]);
}

#[test]
fn test_events_are_mirrored_on_broadcast() {
    let mut h = Harness::running(AppConfig::default());
    let mut rx = h.viz.event_receiver();

    h.viz.note_on(60, 100, h.now());
    assert_eq!(
        rx.try_recv().unwrap(),
        VisualizerEvent::NoteOn {
            note: 60,
            velocity: 100,
            latency: 0.0
        }
    );
    assert!(rx.try_recv().is_err());
}
