//! WebSocket-tunnelled authentication and forwarding
//!
//! Browser WebSocket clients cannot set an `Authorization` header, so
//! Kubernetes clients smuggle the bearer token as a subprotocol of the form
//! `base64url.bearer.authorization.k8s.io.<base64url(token)>`. The handler
//! rewrites that into a normal `Authorization` header, strips the auth
//! entry from the protocol list so only the real channel protocol (e.g.
//! `v4.channel.k8s.io`) is negotiated, and pushes the request through the
//! same authentication path as plain HTTP.
//!
//! The upstream handshake is completed *before* the client upgrade, so
//! authentication and connection failures still surface as HTTP errors;
//! once both sides are upgraded the forwarder copies frames verbatim in
//! both directions and tears both connections down together.

use axum::body::Body;
use axum::extract::ws::{CloseFrame, Message as ClientMessage, WebSocket, WebSocketUpgrade};
use axum::extract::FromRequestParts;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use futures::{SinkExt, StreamExt};
use http::header::{HeaderMap, HeaderValue, AUTHORIZATION, SEC_WEBSOCKET_PROTOCOL};
use http::Request;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as UpstreamCloseFrame;
use tokio_tungstenite::tungstenite::Message as UpstreamMessage;
use tokio_tungstenite::{connect_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::proxy::dispatch::{apply_context, sanitize_request_headers, TransportKind};
use crate::proxy::AppState;

/// Subprotocol prefix carrying the bearer token
pub const BEARER_PROTOCOL_PREFIX: &str = "base64url.bearer.authorization.k8s.io.";

/// Is this an RFC 6455 upgrade request?
pub fn is_upgrade_request(headers: &HeaderMap) -> bool {
    let has_upgrade = headers
        .get(http::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);

    let has_connection = headers
        .get(http::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    has_upgrade && has_connection
}

/// All offered subprotocols, in order
fn subprotocols(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect()
}

/// Split the first auth subprotocol out of the offered list.
///
/// Returns the encoded token and the list with that entry removed.
fn split_bearer_subprotocol(protocols: &[String]) -> Option<(String, Vec<String>)> {
    let index = protocols
        .iter()
        .position(|p| p.starts_with(BEARER_PROTOCOL_PREFIX))?;

    let encoded = protocols[index]
        .strip_prefix(BEARER_PROTOCOL_PREFIX)
        .unwrap_or_default()
        .to_string();

    let remaining = protocols
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != index)
        .map(|(_, p)| p.clone())
        .collect();

    Some((encoded, remaining))
}

/// Decode the token payload of the auth subprotocol
fn decode_subprotocol_token(encoded: &str) -> Result<String> {
    let bytes = URL_SAFE_NO_PAD
        .decode(encoded.trim_end_matches('='))
        .map_err(|e| Error::BadRequest(format!("invalid bearer subprotocol encoding: {}", e)))?;
    String::from_utf8(bytes)
        .map_err(|_| Error::BadRequest("bearer subprotocol is not valid UTF-8".into()))
}

/// Handle a WebSocket upgrade through the auth pipeline.
///
/// Every failure until the final `on_upgrade` answers as plain HTTP, which
/// is what clients expect before the 101.
pub(crate) async fn handle(
    state: &AppState,
    remote_addr: String,
    req: Request<Body>,
) -> Result<super::PipelineOutcome> {
    let (mut parts, _body) = req.into_parts();

    // The auth entry never makes it into `remaining`, which is the only
    // protocol list either side is offered from here on: it is what the
    // upstream handshake sends and what client negotiation selects from.
    let offered = subprotocols(&parts.headers);
    let remaining = match split_bearer_subprotocol(&offered) {
        Some((encoded, remaining)) => {
            let token = decode_subprotocol_token(&encoded)?;
            parts.headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {}", token))
                    .map_err(|_| Error::BadRequest("bearer token is not a valid header".into()))?,
            );
            remaining
        }
        // No auth subprotocol; an Authorization header may still be present.
        None => offered,
    };

    let (ctx, user) = crate::proxy::resolve_request(state, &mut parts.headers, &remote_addr).await?;

    // Headers for the upstream handshake: everything the pipeline left,
    // minus the client's handshake-specific fields (the upstream handshake
    // generates its own).
    let mut upstream_headers = parts.headers.clone();
    sanitize_request_headers(&mut upstream_headers);
    for name in [
        "sec-websocket-key",
        "sec-websocket-version",
        "sec-websocket-extensions",
        "sec-websocket-protocol",
    ] {
        upstream_headers.remove(name);
    }

    let kind = apply_context(&ctx, &mut upstream_headers)?;

    let tls = match kind {
        TransportKind::Privileged => {
            if let Some(bearer) = &state.transports.ws.bearer {
                upstream_headers.insert(
                    AUTHORIZATION,
                    HeaderValue::from_str(&format!("Bearer {}", bearer))
                        .map_err(|_| Error::internal("privileged bearer is not a valid header"))?,
                );
            }
            state.transports.ws.privileged_tls.clone()
        }
        TransportKind::Anonymous => state
            .transports
            .ws
            .anonymous_tls
            .clone()
            .ok_or_else(|| Error::internal("anonymous upstream transport not configured"))?,
    };

    if !remaining.is_empty() {
        let joined = remaining.join(", ");
        upstream_headers.insert(
            SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_str(&joined)
                .map_err(|_| Error::BadRequest("invalid subprotocol list".into()))?,
        );
    }

    let uri = upstream_ws_uri(&state.transports.base_url, &parts.uri)?;
    let mut handshake = Request::builder()
        .method(http::Method::GET)
        .uri(&uri)
        .body(())
        .map_err(|e| Error::internal(format!("failed to build upstream handshake: {}", e)))?;
    *handshake.headers_mut() = upstream_headers;

    debug!(uri = %uri, "dialing upstream websocket");

    let (upstream, handshake_response) = connect_async_tls_with_config(
        handshake,
        None,
        false,
        Some(Connector::Rustls(tls)),
    )
    .await
    .map_err(|e| Error::upstream(format!("upstream websocket handshake failed: {}", e)))?;

    if let Some(protocol) = handshake_response.headers().get(SEC_WEBSOCKET_PROTOCOL) {
        debug!(protocol = ?protocol, "upstream negotiated subprotocol");
    }

    let ws = WebSocketUpgrade::from_request_parts(&mut parts, &())
        .await
        .map_err(|e| Error::BadRequest(format!("invalid websocket upgrade: {}", e)))?;

    let decision = if ctx.no_impersonation() {
        crate::audit::AuditDecision::Passthrough
    } else {
        crate::audit::AuditDecision::Impersonated
    };

    let response = ws
        .protocols(remaining)
        .on_upgrade(move |client| bridge(client, upstream));

    Ok(super::PipelineOutcome {
        response,
        user: Some(user.name),
        decision,
    })
}

/// wss URL for the upstream handshake
fn upstream_ws_uri(base: &http::Uri, request_uri: &http::Uri) -> Result<String> {
    let scheme = match base.scheme_str() {
        Some("https") | None => "wss",
        Some("http") => "ws",
        Some(other) => {
            return Err(Error::config(format!(
                "unsupported upstream scheme {:?}",
                other
            )))
        }
    };
    let authority = base
        .authority()
        .ok_or_else(|| Error::config("upstream URL has no authority"))?;
    let path_and_query = request_uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    Ok(format!("{}://{}{}", scheme, authority, path_and_query))
}

/// Copy frames in both directions until either side closes or fails
async fn bridge(client: WebSocket, upstream: WebSocketStream<MaybeTlsStream<TcpStream>>) {
    let (mut client_tx, mut client_rx) = client.split();
    let (mut upstream_tx, mut upstream_rx) = upstream.split();

    loop {
        tokio::select! {
            msg = client_rx.next() => match msg {
                Some(Ok(msg)) => {
                    if upstream_tx.send(client_to_upstream(msg)).await.is_err() {
                        break;
                    }
                }
                Some(Err(e)) => {
                    warn!(error = %e, "client websocket error");
                    let _ = upstream_tx.send(UpstreamMessage::Close(None)).await;
                    break;
                }
                None => {
                    let _ = upstream_tx.send(UpstreamMessage::Close(None)).await;
                    break;
                }
            },
            msg = upstream_rx.next() => match msg {
                Some(Ok(msg)) => {
                    if let Some(msg) = upstream_to_client(msg) {
                        if client_tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                }
                Some(Err(e)) => {
                    warn!(error = %e, "upstream websocket error");
                    let _ = client_tx.send(ClientMessage::Close(None)).await;
                    break;
                }
                None => {
                    let _ = client_tx.send(ClientMessage::Close(None)).await;
                    break;
                }
            },
        }
    }
}

fn client_to_upstream(msg: ClientMessage) -> UpstreamMessage {
    match msg {
        ClientMessage::Text(text) => UpstreamMessage::Text(text.as_str().into()),
        ClientMessage::Binary(data) => UpstreamMessage::Binary(data),
        ClientMessage::Ping(data) => UpstreamMessage::Ping(data),
        ClientMessage::Pong(data) => UpstreamMessage::Pong(data),
        ClientMessage::Close(frame) => UpstreamMessage::Close(frame.map(|f| UpstreamCloseFrame {
            code: CloseCode::from(f.code),
            reason: f.reason.as_str().into(),
        })),
    }
}

fn upstream_to_client(msg: UpstreamMessage) -> Option<ClientMessage> {
    match msg {
        UpstreamMessage::Text(text) => Some(ClientMessage::Text(text.as_str().into())),
        UpstreamMessage::Binary(data) => Some(ClientMessage::Binary(data)),
        UpstreamMessage::Ping(data) => Some(ClientMessage::Ping(data)),
        UpstreamMessage::Pong(data) => Some(ClientMessage::Pong(data)),
        UpstreamMessage::Close(frame) => Some(ClientMessage::Close(frame.map(|f| CloseFrame {
            code: f.code.into(),
            reason: f.reason.as_str().into(),
        }))),
        // raw frames are an internal tungstenite detail
        UpstreamMessage::Frame(_) => None,
    }
}
