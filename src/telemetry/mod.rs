//! Latency and frame telemetry.
//!
//! The channel keeps a fixed-size ring of network latency samples; the
//! coordinator keeps an exponentially smoothed event latency and a rolling
//! frame-rate history with a monotonic frame-drop counter. Snapshot types live
//! in [`events`].

use std::collections::VecDeque;

pub mod events;

pub use events::{ChannelPhase, ConnectionSummary, LatencyStats, PerformanceSnapshot};

/// Frames counted in the rolling frame-rate history.
pub const FRAME_HISTORY_LEN: usize = 60;

/// A frame counts as dropped below this fraction of the target rate.
pub const FRAME_DROP_RATIO: f64 = 0.8;

/// Weight of the previous average when folding in a new latency sample.
const LATENCY_SMOOTHING: f64 = 0.9;

/// Fixed-capacity latency ring; the oldest sample is evicted on overflow.
#[derive(Debug, Clone)]
pub struct LatencyWindow {
    samples: VecDeque<f64>,
    capacity: usize,
}

impl LatencyWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn observe(&mut self, latency_ms: f64) {
        if !latency_ms.is_finite() {
            return;
        }
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(latency_ms);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn samples(&self) -> impl Iterator<Item = f64> + '_ {
        self.samples.iter().copied()
    }

    pub fn stats(&self) -> LatencyStats {
        let count = self.samples.len();
        if count == 0 {
            return LatencyStats::default();
        }

        let mut sorted: Vec<f64> = self.samples.iter().copied().collect();
        sorted.sort_by(f64::total_cmp);

        let median = if count % 2 == 0 {
            (sorted[count / 2 - 1] + sorted[count / 2]) / 2.0
        } else {
            sorted[count / 2]
        };
        let sum: f64 = sorted.iter().sum();

        LatencyStats {
            min_ms: sorted[0],
            max_ms: sorted[count - 1],
            median_ms: median,
            average_ms: sum / count as f64,
            sample_count: count,
        }
    }
}

/// Exponentially smoothed latency (0.9 previous / 0.1 new).
///
/// The first sample seeds the average.
#[derive(Debug, Clone, Copy, Default)]
pub struct SmoothedLatency {
    average: Option<f64>,
}

impl SmoothedLatency {
    pub fn observe(&mut self, latency_ms: f64) -> f64 {
        let next = match self.average {
            Some(previous) => previous * LATENCY_SMOOTHING + latency_ms * (1.0 - LATENCY_SMOOTHING),
            None => latency_ms,
        };
        self.average = Some(next);
        next
    }

    pub fn value(&self) -> f64 {
        self.average.unwrap_or(0.0)
    }
}

/// Frame-rate bookkeeping driven by consecutive frame timestamps.
#[derive(Debug, Clone)]
pub struct FrameMeter {
    last_frame_ms: Option<f64>,
    history: VecDeque<f64>,
    frame_drops: u64,
}

impl FrameMeter {
    pub fn new() -> Self {
        Self {
            last_frame_ms: None,
            history: VecDeque::with_capacity(FRAME_HISTORY_LEN),
            frame_drops: 0,
        }
    }

    /// Record a rendered frame, returning its instantaneous rate.
    ///
    /// The first frame only establishes the reference timestamp.
    pub fn record_frame(&mut self, now_ms: f64, target_fps: f64) -> Option<f64> {
        let previous = self.last_frame_ms.replace(now_ms)?;
        let delta = now_ms - previous;
        if delta <= 0.0 {
            return None;
        }

        let fps = 1000.0 / delta;
        if self.history.len() == FRAME_HISTORY_LEN {
            self.history.pop_front();
        }
        self.history.push_back(fps);

        if fps < target_fps * FRAME_DROP_RATIO {
            self.frame_drops += 1;
        }
        Some(fps)
    }

    pub fn frame_drops(&self) -> u64 {
        self.frame_drops
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn average_fps(&self) -> f64 {
        if self.history.is_empty() {
            return 0.0;
        }
        self.history.iter().sum::<f64>() / self.history.len() as f64
    }

    /// Forget the reference timestamp so a pause is not counted as one slow frame.
    pub fn reset_reference(&mut self) {
        self.last_frame_ms = None;
    }
}

impl Default for FrameMeter {
    fn default() -> Self {
        Self::new()
    }
}
