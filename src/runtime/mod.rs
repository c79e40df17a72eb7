//! Async driver for the visualizer.
//!
//! [`VisualizerRuntime`] owns a [`Visualizer`] wired to a [`WsTransport`] and
//! a [`HeadlessKeyboard`], and runs one event loop that multiplexes socket
//! events, application commands and the earliest pending deferred task.
//! Every state change happens inside that loop, so the coordinator needs no
//! locks. The loop future is not `Send`; drive it on a current-thread runtime.

use std::rc::Rc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_stream::wrappers::BroadcastStream;

use crate::config::AppConfig;
use crate::error::ErrorCode;
use crate::renderer::HeadlessKeyboard;
use crate::scheduler::{SystemTimeSource, TimeSource};
use crate::telemetry::PerformanceSnapshot;
use crate::visualizer::{HostEvent, Visualizer, VisualizerEvent};

pub mod ws_transport;

pub use ws_transport::{TaggedEvent, WsTransport};

/// Longest the loop sleeps without a pending deadline.
const IDLE_WAKE: Duration = Duration::from_millis(1000);

/// Time allowed for sockets to finish their close handshake on exit.
const CLOSE_GRACE: Duration = Duration::from_millis(250);

pub type LiveVisualizer = Visualizer<HeadlessKeyboard, WsTransport>;

/// Requests from the application into the running loop.
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeCommand {
    Host(HostEvent),
    Ping,
    RequestStatus,
    Reconnect,
    Shutdown,
}

pub struct VisualizerRuntime {
    visualizer: LiveVisualizer,
    clock: Rc<dyn TimeSource>,
    transport_rx: mpsc::UnboundedReceiver<TaggedEvent>,
    commands_tx: mpsc::UnboundedSender<RuntimeCommand>,
    commands_rx: mpsc::UnboundedReceiver<RuntimeCommand>,
    snapshot_rx: watch::Receiver<Option<PerformanceSnapshot>>,
}

impl VisualizerRuntime {
    pub fn new(config: &AppConfig) -> Self {
        let clock: Rc<dyn TimeSource> = Rc::new(SystemTimeSource::default());
        let renderer = HeadlessKeyboard::new(
            config.visualizer.enable_velocity_mapping,
            Rc::clone(&clock),
        );
        let (transport, transport_rx) = WsTransport::new();
        let mut visualizer = Visualizer::new(config, renderer, transport, Rc::clone(&clock));

        let (snapshot_tx, snapshot_rx) = watch::channel(None);
        visualizer.subscribe(move |event| {
            if let VisualizerEvent::PerformanceUpdate { snapshot } = event {
                snapshot_tx.send_replace(Some(snapshot.clone()));
            }
        });

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        Self {
            visualizer,
            clock,
            transport_rx,
            commands_tx,
            commands_rx,
            snapshot_rx,
        }
    }

    /// Sender for [`RuntimeCommand`]s; usable from any task.
    pub fn commands(&self) -> mpsc::UnboundedSender<RuntimeCommand> {
        self.commands_tx.clone()
    }

    pub fn visualizer(&self) -> &LiveVisualizer {
        &self.visualizer
    }

    pub fn visualizer_mut(&mut self) -> &mut LiveVisualizer {
        &mut self.visualizer
    }

    pub fn event_receiver(&self) -> broadcast::Receiver<VisualizerEvent> {
        self.visualizer.event_receiver()
    }

    pub fn event_stream(&self) -> BroadcastStream<VisualizerEvent> {
        self.visualizer.event_stream()
    }

    /// Latest published performance snapshot, `None` before the first report.
    pub fn snapshot_watch(&self) -> watch::Receiver<Option<PerformanceSnapshot>> {
        self.snapshot_rx.clone()
    }

    /// Initialize the visualizer and run until `Shutdown` or every command
    /// sender is dropped.
    pub async fn run(self) -> anyhow::Result<()> {
        let Self {
            mut visualizer,
            clock,
            mut transport_rx,
            commands_tx,
            mut commands_rx,
            ..
        } = self;
        // Keep only external senders alive so dropping them ends the loop.
        drop(commands_tx);

        visualizer
            .initialize()
            .map_err(|err| anyhow::anyhow!(err))
            .context("visualizer initialization failed")?;
        tracing::info!(url = %visualizer.channel().config().url, "visualizer running");

        loop {
            let wait = sleep_budget(visualizer.next_deadline(), clock.now_ms());
            tokio::select! {
                Some((generation, event)) = transport_rx.recv() => {
                    if visualizer.channel().transport().is_current(generation) {
                        visualizer.handle_transport_event(event);
                    } else {
                        tracing::trace!(generation, ?event, "dropping event from retired socket");
                    }
                }
                command = commands_rx.recv() => match command {
                    Some(RuntimeCommand::Shutdown) | None => break,
                    Some(command) => apply_command(&mut visualizer, command),
                },
                _ = tokio::time::sleep(wait) => {}
            }
            visualizer.fire_due();
        }

        tracing::info!("shutting down visualizer");
        visualizer.shutdown();
        visualizer.channel_mut().transport_mut().drain(CLOSE_GRACE).await;
        Ok(())
    }
}

fn sleep_budget(deadline: Option<f64>, now_ms: f64) -> Duration {
    match deadline {
        Some(deadline) => {
            let remaining = (deadline - now_ms).max(0.0);
            Duration::from_secs_f64(remaining / 1000.0).min(IDLE_WAKE)
        }
        None => IDLE_WAKE,
    }
}

fn apply_command(visualizer: &mut LiveVisualizer, command: RuntimeCommand) {
    let result = match command {
        RuntimeCommand::Host(event) => {
            visualizer.handle_host_event(event);
            Ok(())
        }
        RuntimeCommand::Ping => visualizer.channel_mut().ping(),
        RuntimeCommand::RequestStatus => visualizer.channel_mut().request_status(),
        RuntimeCommand::Reconnect => visualizer.channel_mut().reconnect(),
        RuntimeCommand::Shutdown => Ok(()),
    };
    if let Err(err) = result {
        tracing::warn!(code = err.code(), "command failed: {}", err.message());
    }
}
