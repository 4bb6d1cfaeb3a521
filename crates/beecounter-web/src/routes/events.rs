//! `GET /events` - Server-Sent Events stream of device events.

use std::convert::Infallible;
use std::time::Duration;

use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
    routing::get,
    Router,
};
use futures::Stream;
use tracing::debug;

use crate::session::LiveView;
use crate::AppState;

pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

pub fn routes() -> Router<AppState> {
    Router::new().route("/events", get(events))
}

async fn events(
    _access: LiveView,
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    debug!(clients = state.events.client_count() + 1, "SSE client connected");
    Sse::new(state.events.sse_stream()).keep_alive(
        KeepAlive::default()
            .interval(KEEP_ALIVE_INTERVAL)
            .text("keepalive"),
    )
}
