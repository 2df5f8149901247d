//! SSE endpoint streaming change events to a workspace client.

use crate::backend::realtime::ChangeBroadcaster;
use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::stream::Stream;
use futures_util::StreamExt;
use std::convert::Infallible;
use std::time::Duration;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;
use uuid::Uuid;

/// `GET /api/workspaces/{workspace_id}/events`
///
/// Each connected client holds one bounded subscription; the stream ends
/// when the client disconnects, and the broadcaster notices the closed
/// channel on its next publish.
pub async fn change_events(
    Path(workspace_id): Path<Uuid>,
    State(broadcaster): State<ChangeBroadcaster>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let receiver = broadcaster.subscribe(workspace_id).await;
    debug!(workspace = %workspace_id, "event stream opened");

    let stream = ReceiverStream::new(receiver).map(|change| {
        let event = Event::default().event("change");
        Ok(match event.json_data(&change) {
            Ok(event) => event,
            // Serialization of a ChangeEvent cannot realistically fail;
            // fall back to a comment frame rather than killing the stream
            Err(_) => Event::default().comment("serialization failed"),
        })
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(30))
            .text("keep-alive"),
    )
}
