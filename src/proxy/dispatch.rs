//! Terminal dispatch to the upstream
//!
//! The last step of the pipeline. It reads the request context exactly
//! once and either restores the original bearer token and sends through
//! the anonymous transport, or installs the impersonation headers and
//! sends through the privileged transport. A context with neither state is
//! a pipeline bug: the request answers 500 and never leaves the proxy.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use http::header::{HeaderMap, HeaderName};
use http::{Request, Response, Uri};
use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::error::{Error, Result};
use crate::proxy::context::RequestCtx;
use crate::proxy::transport::UpstreamTransport;

/// Which upstream transport a request goes out on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// The proxy's own credentials, with impersonation headers
    Privileged,
    /// Trust anchors only, with the original bearer token restored
    Anonymous,
}

/// Headers that are connection-scoped and never forwarded
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Flush the coalescing buffer early once it holds this much
const MAX_COALESCED_CHUNK: usize = 64 * 1024;

/// Resolve the request context into outbound headers.
///
/// Reads the context once; the returned kind names the transport that must
/// carry the request.
pub fn apply_context(ctx: &RequestCtx, headers: &mut HeaderMap) -> Result<TransportKind> {
    if ctx.no_impersonation() {
        if let Some(token) = ctx.bearer_token() {
            headers.insert(http::header::AUTHORIZATION, token.clone());
        }
        return Ok(TransportKind::Anonymous);
    }

    let decision = ctx
        .impersonation()
        .ok_or_else(|| Error::internal("no impersonation configuration in request context"))?;

    // The privileged transport supplies its own credentials; the user's
    // must be gone by the time the request leaves.
    headers.remove(http::header::AUTHORIZATION);

    for (name, value) in &decision.headers {
        headers.append(name.clone(), value.clone());
    }

    Ok(TransportKind::Privileged)
}

/// Strip headers that must not cross the proxy on the way upstream
pub fn sanitize_request_headers(headers: &mut HeaderMap) {
    remove_hop_by_hop(headers);
    // the upstream host comes from the rest-config, not the client
    headers.remove(http::header::HOST);
}

/// Strip connection-scoped headers from the upstream response
pub fn sanitize_response_headers(headers: &mut HeaderMap) {
    remove_hop_by_hop(headers);
}

fn remove_hop_by_hop(headers: &mut HeaderMap) {
    // Connection may name additional per-hop headers
    let named: Vec<HeaderName> = headers
        .get_all(http::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in named {
        headers.remove(&name);
    }
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

/// The impersonating round-tripper
pub struct UpstreamDispatcher {
    privileged: Arc<dyn UpstreamTransport>,
    anonymous: Option<Arc<dyn UpstreamTransport>>,
    flush_interval: Duration,
}

impl UpstreamDispatcher {
    /// Dispatcher over the shared transports
    pub fn new(
        privileged: Arc<dyn UpstreamTransport>,
        anonymous: Option<Arc<dyn UpstreamTransport>>,
        flush_interval: Duration,
    ) -> Self {
        Self {
            privileged,
            anonymous,
            flush_interval,
        }
    }

    /// Send an authenticated request upstream and stream the response back
    pub async fn dispatch(&self, req: Request<Body>, ctx: &RequestCtx) -> Result<Response<Body>> {
        let (mut parts, body) = req.into_parts();

        sanitize_request_headers(&mut parts.headers);
        let kind = apply_context(ctx, &mut parts.headers)?;
        parts.uri = origin_form(&parts.uri)?;

        let transport = match kind {
            TransportKind::Privileged => &self.privileged,
            TransportKind::Anonymous => self
                .anonymous
                .as_ref()
                .ok_or_else(|| Error::internal("anonymous upstream transport not configured"))?,
        };

        if let Some(decision) = ctx.impersonation() {
            debug!(
                inbound = %decision.inbound.name,
                impersonated = %decision.impersonated.name,
                method = %parts.method,
                path = %parts.uri.path(),
                "dispatching impersonated request"
            );
        }

        let mut response = transport
            .round_trip(Request::from_parts(parts, body))
            .await?;

        sanitize_response_headers(response.headers_mut());

        if !self.flush_interval.is_zero() {
            let every = self.flush_interval;
            response =
                response.map(|b| Body::from_stream(coalesce_chunks(b.into_data_stream(), every)));
        }

        Ok(response)
    }
}

/// Rebase the URI to origin form; the transport's base-URI layer supplies
/// scheme and authority
fn origin_form(uri: &Uri) -> Result<Uri> {
    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    Uri::builder()
        .path_and_query(path_and_query)
        .build()
        .map_err(|e| Error::internal(format!("failed to rebuild request URI: {}", e)))
}

/// Batch response chunks so streamed bodies flush on a fixed cadence.
///
/// Buffered data is emitted on the interval tick, when the buffer exceeds
/// [`MAX_COALESCED_CHUNK`], and at end of stream. Errors flush what is
/// buffered before propagating.
fn coalesce_chunks<S, E>(
    stream: S,
    every: Duration,
) -> impl Stream<Item = std::result::Result<Bytes, E>>
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Send + 'static,
    E: Send + 'static,
{
    enum Event<E> {
        Tick,
        Item(Option<std::result::Result<Bytes, E>>),
    }

    async_stream::stream! {
        futures::pin_mut!(stream);
        let mut buf = BytesMut::new();
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let event = tokio::select! {
                biased;
                _ = ticker.tick() => Event::Tick,
                item = stream.next() => Event::Item(item),
            };

            match event {
                Event::Tick => {
                    if !buf.is_empty() {
                        yield Ok(buf.split().freeze());
                    }
                }
                Event::Item(Some(Ok(chunk))) => {
                    buf.extend_from_slice(&chunk);
                    if buf.len() >= MAX_COALESCED_CHUNK {
                        yield Ok(buf.split().freeze());
                    }
                }
                Event::Item(Some(Err(e))) => {
                    if !buf.is_empty() {
                        yield Ok(buf.split().freeze());
                    }
                    yield Err(e);
                    break;
                }
                Event::Item(None) => {
                    if !buf.is_empty() {
                        yield Ok(buf.split().freeze());
                    }
                    break;
                }
            }
        }
    }
}
