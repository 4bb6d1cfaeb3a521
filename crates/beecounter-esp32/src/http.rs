//! Helpers for serving the device over `EspHttpServer`.
//!
//! [`EspSink`] adapts one server connection to the core `ResponseSink`, so
//! capture and stream logic is shared with the host build. The remaining
//! functions cover what axum's extractors do on Linux: query and form
//! decoding, session checks and JSON replies.

use std::collections::HashMap;

use beecounter_core::capture::{ResponseHead, ResponseSink, SinkError};
use beecounter_core::{Device, DeviceError};
use embedded_svc::http::server::{Connection, Request, Response};
use embedded_svc::http::Headers;
use embedded_svc::io::{Read, Write};
use log::{error, warn};

/// Largest form body accepted.
pub const MAX_FORM_LEN: usize = 2048;

enum SinkState<C: Connection> {
    Pending(Request<C>),
    Started(Response<C>),
    Taken,
}

/// `ResponseSink` over an esp-idf HTTP connection.
pub struct EspSink<C: Connection> {
    state: SinkState<C>,
}

impl<C: Connection> EspSink<C> {
    pub fn new(request: Request<C>) -> Self {
        Self {
            state: SinkState::Pending(request),
        }
    }

    /// Report `err` if nothing has been sent yet; otherwise the body is
    /// simply cut off.
    pub fn finish(self, result: Result<(), DeviceError>) -> anyhow::Result<()> {
        match (self.state, result) {
            (SinkState::Pending(request), Err(err)) => error_reply(request, &err),
            (_, Err(err)) => {
                warn!("Response aborted: {}", err);
                Ok(())
            }
            (_, Ok(())) => Ok(()),
        }
    }
}

impl<C: Connection> ResponseSink for EspSink<C> {
    fn start(&mut self, head: &ResponseHead) -> Result<(), SinkError> {
        match std::mem::replace(&mut self.state, SinkState::Taken) {
            SinkState::Pending(request) => {
                let headers: Vec<(&str, &str)> = head
                    .headers
                    .iter()
                    .map(|(name, value)| (*name, value.as_str()))
                    .collect();
                let response = request
                    .into_response(head.status, None, &headers)
                    .map_err(|e| SinkError::Transport(format!("{:?}", e)))?;
                self.state = SinkState::Started(response);
                Ok(())
            }
            other => {
                self.state = other;
                Err(SinkError::Transport("response already started".into()))
            }
        }
    }

    fn write_chunk(&mut self, data: &[u8]) -> Result<(), SinkError> {
        match &mut self.state {
            SinkState::Started(response) => response.write_all(data).map_err(|_| SinkError::Closed),
            _ => Err(SinkError::Transport("response not started".into())),
        }
    }
}

/// Decode `application/x-www-form-urlencoded` text.
pub fn url_decode(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    String::from_utf8_lossy(&urlencoding::decode_binary(spaced.as_bytes())).into_owned()
}

/// Parse `a=1&b=2` pairs.
pub fn parse_pairs(raw: &str) -> HashMap<String, String> {
    raw.split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (url_decode(key), url_decode(value))
        })
        .collect()
}

/// Query parameters of a request URI.
pub fn query_params(uri: &str) -> HashMap<String, String> {
    uri.split_once('?')
        .map(|(_, query)| parse_pairs(query))
        .unwrap_or_default()
}

/// Read and parse a url-encoded form body.
pub fn read_form<C: Connection>(request: &mut Request<C>) -> anyhow::Result<HashMap<String, String>> {
    let mut body = Vec::new();
    let mut buf = [0u8; 256];
    loop {
        let n = request
            .read(&mut buf)
            .map_err(|e| anyhow::anyhow!("reading body: {:?}", e))?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&buf[..n]);
        if body.len() > MAX_FORM_LEN {
            anyhow::bail!("form body too large");
        }
    }
    Ok(parse_pairs(&String::from_utf8_lossy(&body)))
}

pub fn is_authenticated<C: Connection>(device: &Device, request: &Request<C>) -> bool {
    device.auth().is_authenticated(request.header("Cookie"))
}

/// Live-view access: open unless `protect_live_view` is set.
pub fn live_view_allowed<C: Connection>(device: &Device, request: &Request<C>) -> bool {
    !device.config().protect_live_view || is_authenticated(device, request)
}

pub fn json_reply<C: Connection>(
    request: Request<C>,
    status: u16,
    body: &serde_json::Value,
) -> anyhow::Result<()> {
    let text = serde_json::to_string(body)?;
    let mut response = request
        .into_response(status, None, &[("Content-Type", "application/json")])
        .map_err(|e| anyhow::anyhow!("{:?}", e))?;
    response
        .write_all(text.as_bytes())
        .map_err(|e| anyhow::anyhow!("{:?}", e))?;
    Ok(())
}

pub fn error_reply<C: Connection>(request: Request<C>, err: &DeviceError) -> anyhow::Result<()> {
    let status = err.status_code();
    if status >= 500 {
        error!("Request failed ({}): {}", status, err);
    } else {
        warn!("Request rejected ({}): {}", status, err);
    }
    json_reply(request, status, &serde_json::json!({ "error": err.to_string() }))
}

pub fn redirect<C: Connection>(request: Request<C>, location: &str, cookie: Option<&str>) -> anyhow::Result<()> {
    let mut headers = vec![("Location", location)];
    if let Some(cookie) = cookie {
        headers.push(("Set-Cookie", cookie));
    }
    request
        .into_response(303, None, &headers)
        .map_err(|e| anyhow::anyhow!("{:?}", e))?;
    Ok(())
}
