use std::convert::Infallible;
use std::pin::Pin;
use std::time::Duration;

use axum::response::sse::{Event, KeepAlive, Sse};
use futures::{Stream, StreamExt};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::visualizer::VisualizerEvent;

pub type EventStream = Sse<Pin<Box<dyn Stream<Item = Result<Event, Infallible>> + Send>>>;

/// Build a Server-Sent Events stream of application events, named by type.
pub fn visualizer_events(receiver: broadcast::Receiver<VisualizerEvent>) -> EventStream {
    // Lagged receivers skip what they missed rather than ending the stream.
    let stream = BroadcastStream::new(receiver).filter_map(|result| async move {
        let event = result.ok()?;
        let payload = serde_json::to_string(&event).ok()?;
        Some(Ok(Event::default().event(event.name()).data(payload)))
    });

    Sse::new(Box::pin(stream) as Pin<Box<_>>).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(5))
            .text("debug-keepalive"),
    )
}
