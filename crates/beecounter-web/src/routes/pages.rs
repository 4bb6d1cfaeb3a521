//! HTML pages.
//!
//! Endpoints:
//! - `GET /` - live monitor with collection controls

use axum::{
    extract::State,
    http::HeaderMap,
    response::{Html, IntoResponse, Redirect, Response},
    routing::get,
    Router,
};
use beecounter_core::StreamMode;

use crate::error::ApiResult;
use crate::session::is_authenticated;
use crate::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/", get(index))
}

const STYLE: &str = "body{font-family:-apple-system,BlinkMacSystemFont,'Segoe UI',Roboto,Helvetica,Arial,sans-serif;\
margin:0;background:#1a1a1a;color:#FFC300;text-align:center}\
main{max-width:960px;margin:auto;padding:1.5rem}\
nav a{color:#FFC300;margin:0 .75rem}\
.card{background:#444;border:2px solid #FFC300;border-radius:12px;padding:1.5rem;margin:1rem 0}\
input,select{padding:.5rem;border:1px solid #FFC300;border-radius:6px;background:#333;color:#fff}\
button{padding:.6rem 1.2rem;border:0;border-radius:6px;background:#FFC300;color:#1a1a1a;font-weight:600;cursor:pointer}\
.error{color:#ff6b6b}.ok{color:#8fd18f}img{max-width:100%}";

pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Wrap `body` in the common page shell. `nav` adds the tab bar.
pub fn page(title: &str, body: &str, nav: bool) -> Html<String> {
    let nav = if nav {
        "<nav><a href='/'>Monitor</a><a href='/admin'>Admin</a><a href='/logout'>Logout</a></nav>"
    } else {
        ""
    };
    Html(format!(
        "<!DOCTYPE html><html lang='en'><head><meta charset='UTF-8'>\
<meta name='viewport' content='width=device-width, initial-scale=1.0'>\
<title>BeeCounter - {title}</title><style>{STYLE}</style></head>\
<body><main>{nav}{body}</main></body></html>",
        title = escape_html(title),
    ))
}

fn live_view(mode: StreamMode) -> &'static str {
    match mode {
        StreamMode::Multipart => "<img id='live' src='/stream' alt='Live view'>",
        StreamMode::Polling => {
            "<img id='live' src='/stream' alt='Live view'>\
<script>setInterval(()=>{document.getElementById('live').src='/stream?t='+Date.now()},1000);</script>"
        }
    }
}

const MONITOR_SCRIPT: &str = "<script>\
function post(url){fetch(url,{method:'POST'}).then(r=>r.json()).then(j=>{document.getElementById('msg').textContent=j.message||j.error||''})}\
const es=new EventSource('/events');\
es.addEventListener('collection_update',e=>{const d=JSON.parse(e.data);\
document.getElementById('progress').textContent=d.collected+' / '+d.total+' ('+d.progress+'%)'});\
es.addEventListener('collection_status',e=>{document.getElementById('state').textContent=JSON.parse(e.data).state});\
es.addEventListener('performance_update',e=>{const d=JSON.parse(e.data);\
document.getElementById('perf').textContent='CPU '+d.cpu_core_0.toFixed(0)+'% / '+d.cpu_core_1.toFixed(0)+\
'%, heap '+Math.round(d.heap_used/1024)+' / '+Math.round(d.heap_total/1024)+' KB'});\
es.addEventListener('ei_upload_status',e=>{document.getElementById('msg').textContent=JSON.parse(e.data).message});\
</script>";

async fn index(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<Response> {
    if !is_authenticated(&headers, &state) || state.device.auth().is_default_password()? {
        return Ok(Redirect::to("/login").into_response());
    }
    let device = &state.device;
    let name = escape_html(&device.device_name()?);
    let snapshot = device.collection()?;
    let state_label = if snapshot.active { "started" } else { "stopped" };
    let body = format!(
        "<h1>{name}</h1>\
<div class='card'>{live}</div>\
<div class='card'><h2>Data Collection</h2>\
<p>State: <span id='state'>{state_label}</span> &middot; Progress: <span id='progress'>{collected} / {target}</span></p>\
<button onclick=\"post('/api/capture/start')\">Start</button> \
<button onclick=\"post('/api/capture/stop')\">Stop</button> \
<button onclick=\"post('/api/capture/photo')\">Take Photo</button>\
<p id='msg'></p></div>\
<div class='card'><h2>Edge Impulse</h2>\
<form onsubmit=\"event.preventDefault();fetch('/api/edgeimpulse/upload',{{method:'POST',body:new URLSearchParams(new FormData(this))}})\">\
<input name='ei-label' placeholder='Label' required> <button>Upload Images</button></form></div>\
<p id='perf'></p>{script}",
        live = live_view(device.config().stream_mode),
        collected = snapshot.collected,
        target = snapshot.target,
        script = MONITOR_SCRIPT,
    );
    Ok(page(&device.device_name()?, &body, true).into_response())
}
