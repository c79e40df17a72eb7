// keyglow - real-time MIDI piano visualizer core
// Resilient MIDI event channel, key animation state and performance telemetry

// Module declarations
pub mod channel;
pub mod config;
pub mod error;
pub mod http;
pub mod renderer;
pub mod runtime;
pub mod scheduler;
pub mod simulator;
pub mod subscribers;
pub mod telemetry;
pub mod visualizer;

// Re-exports for convenience
pub use channel::{ConnectionChannel, MidiEvent, MidiEventKind};
pub use config::AppConfig;
pub use error::{ChannelError, ErrorCode, InitError, InitStage, RendererError};
pub use renderer::{HeadlessKeyboard, RendererSurface};
pub use runtime::{RuntimeCommand, VisualizerRuntime};
pub use telemetry::PerformanceSnapshot;
pub use visualizer::{HostEvent, Visualizer, VisualizerEvent};

use tracing_subscriber::EnvFilter;

/// Install the stderr tracing subscriber used by the binaries.
///
/// `RUST_LOG` wins over `default_filter`. `log` records from library code are
/// forwarded into the same subscriber. Calling this twice is a no-op.
pub fn init_logging(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
