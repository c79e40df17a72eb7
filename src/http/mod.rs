//! Debug HTTP server surfaced only in debug feature builds.
//!
//! Exposes `/health`, `/api/status` with the latest performance snapshot, and
//! an SSE stream of application events. The server gets its own thread and
//! multi-thread runtime; the visualizer loop only hands over a snapshot watch
//! and an event sender.

#[cfg(all(feature = "debug_http", debug_assertions))]
mod routes;
#[cfg(all(feature = "debug_http", debug_assertions))]
mod sse;

#[cfg(all(feature = "debug_http", debug_assertions))]
pub use routes::{build_router, run_http_server, DebugHttpState};

use tokio::sync::{broadcast, watch};

use crate::telemetry::PerformanceSnapshot;
use crate::visualizer::VisualizerEvent;

pub const ADDR_ENV: &str = "KEYGLOW_DEBUG_HTTP_ADDR";
pub const TOKEN_ENV: &str = "KEYGLOW_DEBUG_TOKEN";
pub const DEFAULT_ADDR: &str = "127.0.0.1:8787";
pub const DEFAULT_TOKEN: &str = "keyglow-debug";

/// Whether this build carries the debug server at all.
pub const fn is_available() -> bool {
    cfg!(all(feature = "debug_http", debug_assertions))
}

/// Start the debug server once per process. A no-op in builds without it.
pub fn spawn_if_enabled(
    snapshots: watch::Receiver<Option<PerformanceSnapshot>>,
    events: broadcast::Sender<VisualizerEvent>,
) {
    #[cfg(all(feature = "debug_http", debug_assertions))]
    server::spawn(snapshots, events);

    #[cfg(not(all(feature = "debug_http", debug_assertions)))]
    {
        let _ = (snapshots, events);
        log::debug!("[DebugHttp] Not compiled into this build");
    }
}

#[cfg(all(feature = "debug_http", debug_assertions))]
mod server {
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    use tokio::sync::{broadcast, watch};

    use super::{DebugHttpState, ADDR_ENV, DEFAULT_ADDR, DEFAULT_TOKEN, TOKEN_ENV};
    use crate::telemetry::PerformanceSnapshot;
    use crate::visualizer::VisualizerEvent;

    static RUNNING: AtomicBool = AtomicBool::new(false);

    pub(super) fn bind_addr(raw: Option<String>) -> SocketAddr {
        let fallback = SocketAddr::from(([127, 0, 0, 1], 8787));
        match raw.as_deref().unwrap_or(DEFAULT_ADDR).parse() {
            Ok(addr) => addr,
            Err(_) => {
                log::warn!(
                    "[DebugHttp] Unparseable {}={:?}, using {}",
                    ADDR_ENV,
                    raw,
                    fallback
                );
                fallback
            }
        }
    }

    pub(super) fn spawn(
        snapshots: watch::Receiver<Option<PerformanceSnapshot>>,
        events: broadcast::Sender<VisualizerEvent>,
    ) {
        if RUNNING.swap(true, Ordering::SeqCst) {
            log::warn!("[DebugHttp] Server already running");
            return;
        }

        let addr = bind_addr(std::env::var(ADDR_ENV).ok());
        let token = std::env::var(TOKEN_ENV).unwrap_or_else(|_| DEFAULT_TOKEN.to_string());

        thread::spawn(move || {
            let runtime = match tokio::runtime::Builder::new_multi_thread()
                .worker_threads(2)
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(err) => {
                    log::error!("[DebugHttp] Could not build runtime: {}", err);
                    RUNNING.store(false, Ordering::SeqCst);
                    return;
                }
            };

            log::info!("[DebugHttp] Serving on http://{}", addr);
            runtime.block_on(async move {
                let state = DebugHttpState::new(snapshots, events, token);
                if let Err(err) = super::run_http_server(state, addr).await {
                    log::error!("[DebugHttp] Stopped: {:#}", err);
                }
            });
            RUNNING.store(false, Ordering::SeqCst);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_without_the_server_is_a_no_op() {
        if is_available() {
            return;
        }
        let (_snapshot_tx, snapshots) = watch::channel(None);
        let (events, _) = broadcast::channel(4);
        spawn_if_enabled(snapshots.clone(), events.clone());
        spawn_if_enabled(snapshots, events);
    }

    #[cfg(all(feature = "debug_http", debug_assertions))]
    #[test]
    fn bind_addr_falls_back_on_garbage() {
        assert_eq!(server::bind_addr(None).to_string(), DEFAULT_ADDR);
        assert_eq!(
            server::bind_addr(Some("0.0.0.0:9000".into())).to_string(),
            "0.0.0.0:9000"
        );
        assert_eq!(
            server::bind_addr(Some("not an address".into())).to_string(),
            DEFAULT_ADDR
        );
    }
}
