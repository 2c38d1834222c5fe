//! Server-Sent Events support

use crate::runtime::{AppSnapshot, StateEvent};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::time::Duration;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

/// Snapshot first, then every state event as it happens. The stream ends
/// when `shutdown` fires so graceful shutdown is not held open.
pub fn sse_stream(
    init: AppSnapshot,
    broadcast_rx: tokio::sync::broadcast::Receiver<StateEvent>,
    shutdown: CancellationToken,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let init = futures::stream::once(async move { Ok(init_event(&init)) });

    let broadcasts = BroadcastStream::new(broadcast_rx).filter_map(|result| match result {
        Ok(event) => Some(Ok(state_event_to_axum(&event))),
        Err(e) => {
            // Lagged clients can refetch /api/state
            tracing::warn!(error = %e, "SSE client fell behind, skipping events");
            None
        }
    });

    let combined =
        futures::StreamExt::take_until(init.chain(broadcasts), shutdown.cancelled_owned());

    Sse::new(combined).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}

fn init_event(snapshot: &AppSnapshot) -> Event {
    let data = json!({
        "type": "init",
        "state": serde_json::to_value(snapshot).unwrap_or(Value::Null),
    });
    Event::default().event("init").data(data.to_string())
}

fn state_event_to_axum(event: &StateEvent) -> Event {
    let data = serde_json::to_value(event).unwrap_or(Value::Null);
    Event::default().event(event.name()).data(data.to_string())
}
