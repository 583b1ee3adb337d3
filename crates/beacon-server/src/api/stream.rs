//! Live status stream over server-sent events.
//!
//! A new subscriber first receives the latest status snapshot, then every
//! later snapshot as a `status` event. Lost beacons arrive as `lost` events.

use std::convert::Infallible;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::{self, Stream, StreamExt};
use tokio_stream::wrappers::{BroadcastStream, WatchStream};
use tracing::warn;

use crate::api::beacons::StatusResponse;
use crate::state::SharedState;

/// Stream status snapshots and lost events.
#[utoipa::path(
    get,
    path = "/api/status/stream",
    tag = "beacons",
    operation_id = "streamStatus",
    summary = "Stream beacon status",
    description = "Server-sent events. `status` events carry a StatusResponse \
        and start with the current snapshot. `lost` events carry a LostBeacon.",
    responses(
        (status = 200, description = "Event stream", content_type = "text/event-stream", body = StatusResponse)
    )
)]
pub async fn stream_status(
    State(state): State<SharedState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let status = WatchStream::new(state.engine.subscribe_status())
        .map(|snapshot| event("status", &StatusResponse::from(&snapshot)));

    let lost = BroadcastStream::new(state.engine.subscribe_lost()).map(|received| match received {
        Ok(lost) => event("lost", &lost),
        Err(e) => {
            warn!(error = %e, "Status stream subscriber fell behind on lost events");
            None
        }
    });

    Sse::new(stream::select(status, lost).filter_map(|item| async move { item.map(Ok) }))
        .keep_alive(KeepAlive::default())
}

fn event<T: serde::Serialize>(name: &str, data: &T) -> Option<Event> {
    match Event::default().event(name).json_data(data) {
        Ok(event) => Some(event),
        Err(e) => {
            warn!(error = %e, event = name, "Failed to encode stream event");
            None
        }
    }
}
