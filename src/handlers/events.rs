// ---------------------------------------------------------------------------
// handlers/events.rs: SSE stream of server-list snapshots
// ---------------------------------------------------------------------------

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::{Stream, StreamExt, future, stream};
use tokio_stream::wrappers::BroadcastStream;

use crate::mcp::service::Snapshot;
use crate::state::AppState;

fn snapshot_event(snapshot: &Snapshot) -> Event {
    Event::default()
        .event("servers")
        .json_data(snapshot.as_slice())
        .unwrap_or_default()
}

/// GET /api/mcp/events: the current list first, then one event per change.
/// Slow consumers skip missed snapshots; the next one is complete anyway.
pub async fn server_events(State(state): State<AppState>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let updates = BroadcastStream::new(state.service.subscribe());
    let current: Snapshot = Arc::new(state.service.get_servers());

    let events = stream::once(future::ready(current))
        .chain(updates.filter_map(|item| future::ready(item.ok())))
        .map(|snapshot| Ok::<_, Infallible>(snapshot_event(&snapshot)));

    Sse::new(events).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)).text("heartbeat"))
}
