use serde::{Deserialize, Serialize};

use crate::channel::MidiEvent;
use crate::error::InitStage;
use crate::telemetry::PerformanceSnapshot;

/// Simplified lifecycle and note events forwarded to the application.
///
/// Serialized as `{"type": <name>, "payload": {...}}`, the same envelope the
/// wire protocol uses, so the CLI can print them as JSON lines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum VisualizerEvent {
    Initialized,
    Error {
        /// Set when initialization failed.
        stage: Option<InitStage>,
        message: String,
    },
    MidiConnected,
    MidiDisconnected {
        code: u16,
        reason: String,
    },
    MidiError {
        message: String,
    },
    ContextLost,
    ContextRestored,
    NoteOn {
        note: i32,
        velocity: u8,
        latency: f64,
    },
    NoteOff {
        note: i32,
        latency: f64,
    },
    HighLatency {
        latency: f64,
        event: MidiEvent,
    },
    PerformanceUpdate {
        snapshot: PerformanceSnapshot,
    },
}

impl VisualizerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            VisualizerEvent::Initialized => "initialized",
            VisualizerEvent::Error { .. } => "error",
            VisualizerEvent::MidiConnected => "midi_connected",
            VisualizerEvent::MidiDisconnected { .. } => "midi_disconnected",
            VisualizerEvent::MidiError { .. } => "midi_error",
            VisualizerEvent::ContextLost => "context_lost",
            VisualizerEvent::ContextRestored => "context_restored",
            VisualizerEvent::NoteOn { .. } => "note_on",
            VisualizerEvent::NoteOff { .. } => "note_off",
            VisualizerEvent::HighLatency { .. } => "high_latency",
            VisualizerEvent::PerformanceUpdate { .. } => "performance_update",
        }
    }
}

/// Host-environment lifecycle notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostEvent {
    Resize { width: u32, height: u32 },
    ContextLost,
    ContextRestored,
}
