//! WebSocket tunneling.
//!
//! Upgrade requests are answered locally with a 101 and a derived accept
//! key, then bridged to the backend over a second WebSocket connection.
//! Frames flow both ways until either side closes; if the upstream
//! connection cannot be established the local socket is closed cleanly
//! instead of being left hanging.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::WebSocketStream;

use gangway_core::PROXY_PREFIX;

use crate::engine::{diagnostic, empty_body, ForwardingEngine, ProxyBody};

/// Request headers carried over to the upstream WebSocket handshake.
const FORWARDED_HEADERS: &[&str] = &[
    "cookie",
    "authorization",
    "user-agent",
    "accept-language",
    "origin",
    "sec-websocket-protocol",
];

/// True when the request asks for a WebSocket upgrade.
pub(crate) fn is_websocket_upgrade(req: &Request<Incoming>) -> bool {
    let upgrade = req
        .headers()
        .get(hyper::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    let connection = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("upgrade"))
        .unwrap_or(false);
    upgrade && connection
}

/// Answers the upgrade locally and bridges frames to the backend.
pub(crate) async fn proxy_upgrade(
    engine: Arc<ForwardingEngine>,
    mut req: Request<Incoming>,
    remote: SocketAddr,
) -> Response<ProxyBody> {
    let Some(key) = req
        .headers()
        .get("sec-websocket-key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
    else {
        return diagnostic(StatusCode::BAD_REQUEST, "missing Sec-WebSocket-Key");
    };
    let accept = derive_accept_key(key.as_bytes());

    let path_qs = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());

    let upstream_url = format!(
        "{}{}{}",
        ws_scheme(&engine.config.upstream_url),
        PROXY_PREFIX,
        path_qs
    );

    let forwarded: Vec<(String, String)> = req
        .headers()
        .iter()
        .filter(|(name, _)| FORWARDED_HEADERS.contains(&name.as_str().to_ascii_lowercase().as_str()))
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();

    let protocol = req
        .headers()
        .get("sec-websocket-protocol")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    engine.stats.websockets.fetch_add(1, Ordering::Relaxed);
    tracing::info!(path = %path_qs, %remote, "tunneling websocket");

    let upgrade = hyper::upgrade::on(&mut req);
    tokio::spawn(async move {
        let upgraded = match upgrade.await {
            Ok(upgraded) => upgraded,
            Err(e) => {
                tracing::warn!(error = %e, "websocket upgrade failed");
                return;
            }
        };
        let client_ws =
            WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;
        bridge(client_ws, &upstream_url, &forwarded).await;
    });

    let mut builder = Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(hyper::header::UPGRADE, "websocket")
        .header(hyper::header::CONNECTION, "Upgrade")
        .header("sec-websocket-accept", accept);
    if let Some(protocol) = protocol {
        builder = builder.header("sec-websocket-protocol", protocol);
    }
    builder
        .body(empty_body())
        .unwrap_or_else(|_| diagnostic(StatusCode::INTERNAL_SERVER_ERROR, "response build failed"))
}

/// Connects upstream and pumps frames both ways. On upstream failure the
/// caller-side socket is closed with a normal close frame.
async fn bridge<S>(mut client_ws: WebSocketStream<S>, upstream_url: &str, headers: &[(String, String)])
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let upstream_req = match build_upstream_request(upstream_url, headers) {
        Ok(req) => req,
        Err(e) => {
            tracing::warn!(error = %e, "invalid upstream websocket request");
            let _ = client_ws.close(None).await;
            return;
        }
    };

    let upstream_ws = match tokio_tungstenite::connect_async(upstream_req).await {
        Ok((ws, _)) => ws,
        Err(e) => {
            tracing::warn!(error = %e, url = upstream_url, "upstream websocket connect failed");
            let _ = client_ws.close(None).await;
            return;
        }
    };

    let (mut upstream_tx, mut upstream_rx) = upstream_ws.split();
    let (mut client_tx, mut client_rx) = client_ws.split();

    let client_to_upstream = async {
        while let Some(msg) = client_rx.next().await {
            let Ok(msg) = msg else { break };
            let closing = msg.is_close();
            if upstream_tx.send(msg).await.is_err() || closing {
                break;
            }
        }
        let _ = upstream_tx.close().await;
    };

    let upstream_to_client = async {
        while let Some(msg) = upstream_rx.next().await {
            let Ok(msg) = msg else { break };
            let closing = msg.is_close();
            if client_tx.send(msg).await.is_err() || closing {
                break;
            }
        }
        let _ = client_tx.close().await;
    };

    tokio::join!(client_to_upstream, upstream_to_client);
    tracing::debug!(url = upstream_url, "websocket tunnel closed");
}

fn build_upstream_request(
    url: &str,
    headers: &[(String, String)],
) -> std::result::Result<
    tokio_tungstenite::tungstenite::handshake::client::Request,
    tokio_tungstenite::tungstenite::Error,
> {
    let mut req = url.into_client_request()?;
    for (name, value) in headers {
        if let (Ok(name), Ok(value)) = (
            hyper::header::HeaderName::try_from(name.as_str()),
            hyper::header::HeaderValue::try_from(value.as_str()),
        ) {
            req.headers_mut().insert(name, value);
        }
    }
    Ok(req)
}

/// Maps the backend's HTTP scheme to its WebSocket counterpart.
fn ws_scheme(upstream_url: &str) -> String {
    if let Some(rest) = upstream_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = upstream_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        upstream_url.to_string()
    }
}
