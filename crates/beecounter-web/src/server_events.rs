//! Server-Sent Events for live dashboard updates.
//!
//! Pages connect to `/events` and receive named events whose data is a JSON
//! object:
//!
//! - `hello` - sent once on connect
//! - `performance_update` - CPU, heap, flash, RSSI and temperature figures
//! - `collection_update` - `{ "progress", "collected", "total" }`
//! - `collection_status` - `{ "state": "started" | "stopped" | "complete" }`
//! - `ei_upload_status` - Edge Impulse upload progress
//!
//! ## Message Format
//!
//! ```text
//! event: collection_update
//! data: {"progress":40,"collected":20,"total":50}
//! ```

use std::convert::Infallible;

use axum::response::sse::Event;
use beecounter_core::{DeviceEvent, Notifier};
use futures::{stream, Stream, StreamExt};
use tokio::sync::broadcast;
use tracing::{debug, trace};

/// Events buffered per subscriber before a slow client starts losing them.
pub const EVENT_BUFFER: usize = 64;

/// Fan-out of device events to every connected SSE client.
#[derive(Clone)]
pub struct EventHub {
    tx: broadcast::Sender<DeviceEvent>,
}

impl EventHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUFFER);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.tx.subscribe()
    }

    /// Connected SSE clients.
    pub fn client_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Event stream for one client: `hello`, then every device event.
    pub fn sse_stream(&self) -> impl Stream<Item = Result<Event, Infallible>> {
        let hello = Event::default().event("hello").data("{}");
        let updates = stream::unfold(self.subscribe(), |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => return Some((Ok(to_sse(&event)), rx)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "SSE client lagging, events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        stream::once(async move { Ok(hello) }).chain(updates)
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier for EventHub {
    fn notify(&self, event: DeviceEvent) {
        let name = event.name();
        if self.tx.send(event).is_err() {
            trace!(event = name, "no SSE clients connected");
        }
    }
}

pub fn to_sse(event: &DeviceEvent) -> Event {
    Event::default().event(event.name()).data(event.payload_json())
}
