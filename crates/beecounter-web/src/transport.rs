//! Bridge from the blocking capture code to axum response bodies.
//!
//! Capture handlers run on the blocking pool and write into a
//! [`ChannelSink`]. The status line travels over a oneshot channel, body
//! chunks over a bounded mpsc channel that becomes the response stream. When
//! the client goes away the receiver is dropped and the next write fails
//! with [`SinkError::Closed`], which ends the capture loop.

use std::convert::Infallible;

use axum::{
    body::{Body, Bytes},
    http::{HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use beecounter_core::capture::{ResponseHead, ResponseSink, SinkError};
use beecounter_core::DeviceError;
use tokio::sync::{mpsc, oneshot};
use tracing::error;

use crate::error::ApiError;

/// Chunks buffered between the capture thread and the socket.
pub const BODY_CHANNEL_DEPTH: usize = 8;

pub struct ChannelSink {
    head: Option<oneshot::Sender<ResponseHead>>,
    body: mpsc::Sender<Bytes>,
}

impl ChannelSink {
    pub fn new(head: oneshot::Sender<ResponseHead>, body: mpsc::Sender<Bytes>) -> Self {
        Self {
            head: Some(head),
            body,
        }
    }
}

impl ResponseSink for ChannelSink {
    fn start(&mut self, head: &ResponseHead) -> Result<(), SinkError> {
        let tx = self
            .head
            .take()
            .ok_or_else(|| SinkError::Transport("response already started".to_string()))?;
        tx.send(head.clone()).map_err(|_| SinkError::Closed)
    }

    fn write_chunk(&mut self, data: &[u8]) -> Result<(), SinkError> {
        if self.head.is_some() {
            return Err(SinkError::Transport("body written before start".to_string()));
        }
        self.body
            .blocking_send(Bytes::copy_from_slice(data))
            .map_err(|_| SinkError::Closed)
    }
}

fn build_response(head: ResponseHead, body: mpsc::Receiver<Bytes>) -> Result<Response, ApiError> {
    let stream = futures::stream::unfold(body, |mut rx| async move {
        rx.recv().await.map(|chunk| (Ok::<_, Infallible>(chunk), rx))
    });
    let mut response = Body::from_stream(stream).into_response();
    *response.status_mut() = StatusCode::from_u16(head.status)
        .map_err(|e| ApiError::Internal(format!("bad status {}: {}", head.status, e)))?;
    let headers = response.headers_mut();
    for (name, value) in head.headers {
        let bad_header = |e: &dyn std::fmt::Display| ApiError::Internal(format!("bad header {}: {}", name, e));
        let header_name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| bad_header(&e))?;
        let value = HeaderValue::from_str(&value).map_err(|e| bad_header(&e))?;
        headers.insert(header_name, value);
    }
    Ok(response)
}

/// Run `job` on the blocking pool and stream whatever it writes.
///
/// Errors returned before the job calls `start` become a normal error
/// response; after that the job owns reporting (the status is already sent).
pub async fn blocking_response<F>(job: F) -> Response
where
    F: FnOnce(&mut ChannelSink) -> Result<(), DeviceError> + Send + 'static,
{
    let (head_tx, head_rx) = oneshot::channel();
    let (body_tx, body_rx) = mpsc::channel(BODY_CHANNEL_DEPTH);
    let task = tokio::task::spawn_blocking(move || {
        let mut sink = ChannelSink::new(head_tx, body_tx);
        job(&mut sink)
    });

    match head_rx.await {
        Ok(head) => build_response(head, body_rx).unwrap_or_else(IntoResponse::into_response),
        Err(_) => match task.await {
            Ok(Ok(())) => ApiError::Internal("handler produced no response".to_string()).into_response(),
            Ok(Err(e)) => ApiError::from(e).into_response(),
            Err(e) => {
                error!(error = %e, "capture task panicked");
                ApiError::Internal("capture task failed".to_string()).into_response()
            }
        },
    }
}
