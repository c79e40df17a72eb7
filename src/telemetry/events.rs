//! Telemetry payload types shared by the channel, the coordinator and the
//! reporting surfaces (application listeners, CLI, debug HTTP).

use serde::{Deserialize, Serialize};

/// Connection lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelPhase {
    Disconnected,
    Connecting,
    Connected,
    GivenUp,
}

/// Distribution of the latency samples currently held in the window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencyStats {
    pub min_ms: f64,
    pub max_ms: f64,
    pub median_ms: f64,
    pub average_ms: f64,
    pub sample_count: usize,
}

/// Connection summary reported alongside performance data.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConnectionSummary {
    pub connected: bool,
    pub phase: ChannelPhase,
    pub queued_messages: usize,
    pub reconnect_attempts: u32,
}

/// Performance snapshot recomputed on the report interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSnapshot {
    pub timestamp_ms: f64,
    pub frame_rate: f64,
    pub average_latency_ms: f64,
    pub frame_drops: u64,
    pub active_keys: usize,
    pub latency: LatencyStats,
    pub connection: ConnectionSummary,
}
