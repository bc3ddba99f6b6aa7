//! The HTTP entry point: `/health`, `/quiesce`, and the WebSocket upgrade
//! handshake (spec.md §4.5). A bare `axum::extract::ws::WebSocketUpgrade`
//! can't express the server's precomputed, raw permessage-deflate frames —
//! its `Message` sink reframes every payload itself — so the upgrade here
//! is done by hand: validate the request, answer `101` ourselves, then take
//! the connection over with `hyper::upgrade::on` and drive it with our own
//! frame codec end to end.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use base64::Engine;
use hyper_util::rt::TokioIo;
use log::{debug, info, warn};
use serde::Serialize;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tower_http::trace::TraceLayer;

use crate::amqp::StatusSlot;
use crate::dispatcher::Dispatcher;
use crate::metrics::Counters;
use crate::pump;
use crate::quiesce::QuiesceState;
use crate::signer::Signer;

const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub signer: Arc<Signer>,
    pub quiesce: Arc<QuiesceState>,
    pub counters: Arc<Counters>,
    pub status: Arc<StatusSlot>,
    pub ping_interval: Duration,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/quiesce", post(quiesce))
        .fallback(upgrade_or_reject)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthBody {
    status: &'static str,
    connections: usize,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let connections = state.dispatcher.connection_count();
    if state.quiesce.is_quiesced() {
        (
            StatusCode::GONE,
            axum::Json(HealthBody { status: "quiesced", connections }),
        )
    } else {
        (
            StatusCode::OK,
            axum::Json(HealthBody { status: "OK", connections }),
        )
    }
}

#[derive(Serialize)]
struct QuiesceBody {
    remaining: usize,
}

async fn quiesce(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if !admin_authorized(&state, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    state.quiesce.quiesce();
    axum::Json(QuiesceBody {
        remaining: state.quiesce.connection_count(),
    })
    .into_response()
}

fn admin_authorized(state: &AppState, headers: &HeaderMap) -> bool {
    let Some(auth) = headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()) else {
        return false;
    };
    let Some(token) = auth.strip_prefix("Basic ") else {
        return false;
    };
    let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(token) else {
        return false;
    };
    let Ok(decoded) = String::from_utf8(decoded) else {
        return false;
    };
    state.signer.check_admin(&decoded)
}

fn client_address(headers: &HeaderMap, connect_info: Option<SocketAddr>) -> Option<String> {
    if let Some(addr) = connect_info {
        return Some(addr.to_string());
    }
    let forwarded_for = headers.get("x-forwarded-for")?.to_str().ok()?;
    let forwarded_port = headers.get("x-forwarded-port").and_then(|v| v.to_str().ok());
    match forwarded_port {
        Some(port) => Some(format!("{forwarded_for}:{port}")),
        None => Some(forwarded_for.to_string()),
    }
}

fn query_param<'a>(query: &'a str, key: &str) -> Option<&'a str> {
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == key).then_some(v)
    })
}

fn negotiates_compression(headers: &HeaderMap) -> bool {
    headers
        .get("sec-websocket-extensions")
        .and_then(|v| v.to_str().ok())
        .map(|value| value.split(',').any(|token| token.trim().starts_with("permessage-deflate")))
        .unwrap_or(false)
}

fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

async fn upgrade_or_reject(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
) -> Response {
    let headers = request.headers().clone();
    let path = request.uri().path().to_string();
    let query = request.uri().query().unwrap_or("").to_string();

    let is_upgrade = headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    if !is_upgrade {
        state.counters.record_rejected_not_websocket();
        return (StatusCode::BAD_REQUEST, "you are not a websocket").into_response();
    }

    if client_address(&headers, Some(addr)).is_none() {
        return (StatusCode::BAD_REQUEST, "no client address available").into_response();
    }

    let Some(signature) = query_param(&query, "m") else {
        state.counters.record_rejected_bad_namespace();
        return StatusCode::FORBIDDEN.into_response();
    };
    let namespace = path;
    if state.signer.validate_signature(&namespace, signature).is_err() {
        state.counters.record_rejected_bad_namespace();
        return StatusCode::FORBIDDEN.into_response();
    }

    let compression_negotiated = negotiates_compression(&headers);
    state.counters.record_compression(compression_negotiated);

    if state.quiesce.is_quiesced() {
        return StatusCode::GONE.into_response();
    }

    let Some(client_key) = headers.get("sec-websocket-key").and_then(|v| v.to_str().ok()) else {
        return (StatusCode::BAD_REQUEST, "missing Sec-WebSocket-Key").into_response();
    };
    let accept = accept_key(client_key);
    state.counters.record_connected();

    let upgrade = hyper::upgrade::on(request);
    let state_for_task = Arc::clone(&state);
    tokio::spawn(async move {
        match upgrade.await {
            Ok(upgraded) => {
                serve_connection(state_for_task, TokioIo::new(upgraded), namespace, compression_negotiated).await;
            }
            Err(err) => warn!("websocket upgrade failed: {err}"),
        }
    });

    let mut response = Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(header::UPGRADE, "websocket")
        .header(header::CONNECTION, "Upgrade")
        .header("sec-websocket-accept", accept)
        .body(Body::empty())
        .expect("well-formed upgrade response");

    if compression_negotiated {
        response.headers_mut().insert(
            "sec-websocket-extensions",
            HeaderValue::from_static("permessage-deflate; server_no_context_takeover; client_no_context_takeover"),
        );
    }
    response
}

async fn serve_connection<IO>(state: Arc<AppState>, io: IO, namespace: String, compression_negotiated: bool)
where
    IO: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let (reader, writer) = tokio::io::split(io);
    let (queue, rx) = match state.dispatcher.subscribe(&namespace) {
        Ok(pair) => pair,
        Err(err) => {
            warn!("failed to subscribe connection to {namespace}: {err}");
            return;
        }
    };
    let (conn_id, shed_rx) = state.quiesce.register();

    info!("connection subscribed to {namespace}");
    if let Some(publisher) = state.status.lock().expect("status mutex poisoned").clone() {
        publisher.connect(&namespace).await;
    }

    let mut pump_handle = tokio::spawn(pump::run(writer, rx, shed_rx, state.ping_interval, compression_negotiated));

    tokio::select! {
        _ = read_until_close(reader) => {
            debug!("peer closed {namespace}");
        }
        result = &mut pump_handle => {
            match result {
                Ok(Err(err)) => warn!("pump error on {namespace}: {err}"),
                Err(err) => warn!("pump task panicked on {namespace}: {err}"),
                Ok(Ok(())) => debug!("shed or unsubscribed {namespace}"),
            }
        }
    }

    pump_handle.abort();
    state.dispatcher.unsubscribe(&namespace, &queue);
    state.quiesce.deregister(conn_id);
    if let Some(publisher) = state.status.lock().expect("status mutex poisoned").clone() {
        publisher.disconnect(&namespace).await;
    }
    state.counters.record_lost();
}

/// Reads and discards inbound frames until the peer closes the stream or
/// sends a Close control frame (spec.md §4.5 step 7: the server is
/// write-dominant, inbound frames exist only to detect disconnect).
async fn read_until_close<R>(mut reader: R) -> std::io::Result<()>
where
    R: AsyncReadExt + Unpin,
{
    loop {
        let mut header = [0u8; 2];
        if reader.read_exact(&mut header).await.is_err() {
            return Ok(());
        }
        let opcode = header[0] & 0x0f;
        let masked = header[1] & 0x80 != 0;
        let mut len = u64::from(header[1] & 0x7f);
        if len == 126 {
            let mut ext = [0u8; 2];
            reader.read_exact(&mut ext).await?;
            len = u64::from(u16::from_be_bytes(ext));
        } else if len == 127 {
            let mut ext = [0u8; 8];
            reader.read_exact(&mut ext).await?;
            len = u64::from_be_bytes(ext);
        }

        if masked {
            let mut mask_key = [0u8; 4];
            reader.read_exact(&mut mask_key).await?;
        }

        let mut payload = vec![0u8; len as usize];
        reader.read_exact(&mut payload).await?;

        if opcode == 0x8 {
            return Ok(());
        }
    }
}
