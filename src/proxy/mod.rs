//! The per-request proxy pipeline
//!
//! Every path and method lands in one fallback handler and walks the same
//! ordered pipeline:
//!
//! ```text
//! panic guard → audit begin → authenticate ──┬─ reject → 401
//!                                            │
//!                       nested Impersonate-*?├─ SAR gate ─ deny → 403
//!                                            │
//!                             build decision → dispatch → stream → audit end
//! ```
//!
//! WebSocket upgrades branch off before authentication only to rewrite the
//! subprotocol token into an `Authorization` header; they then flow through
//! the same [`resolve_request`] as plain HTTP.

pub mod context;
pub mod dispatch;
pub mod headers;
pub mod transport;
pub mod websocket;

use std::any::Any;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::response::{IntoResponse, Response};
use axum::Router;
use http::{HeaderMap, Request};
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::audit::{AuditDecision, AuditEvent, AuditSink};
use crate::auth::access_review::{ImpersonationAuthorizer, ImpersonationRequest};
use crate::auth::{extract_bearer_token, AuthChain, Authenticated, AuthenticatedUser};
use crate::config::ProxyConfig;
use crate::error::{AuthError, Error, Result};
use self::context::RequestCtx;
use self::dispatch::UpstreamDispatcher;
use self::headers::{build_decision, strip_impersonation_headers};
use self::transport::UpstreamTransports;

/// Shared state for the request pipeline
#[derive(Clone)]
pub struct AppState {
    /// Authentication chain (OIDC, optional TokenReview fallback)
    pub auth: Arc<AuthChain>,
    /// Nested-impersonation gate; `None` when impersonation is disabled
    pub gate: Option<Arc<dyn ImpersonationAuthorizer>>,
    /// Terminal dispatcher
    pub dispatcher: Arc<UpstreamDispatcher>,
    /// Shared transports (the WebSocket path dials upstream itself)
    pub transports: Arc<UpstreamTransports>,
    /// Audit sink
    pub audit: AuditSink,
    /// Behaviour configuration
    pub config: Arc<ProxyConfig>,
}

/// Result of a fully processed request, for the audit completion record
pub(crate) struct PipelineOutcome {
    pub(crate) response: Response,
    pub(crate) user: Option<String>,
    pub(crate) decision: AuditDecision,
}

impl std::fmt::Debug for PipelineOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineOutcome")
            .field("status", &self.response.status())
            .field("user", &self.user)
            .field("decision", &self.decision)
            .finish()
    }
}

/// Build the proxy router: one fallback handler behind the panic guard and
/// request logger
pub fn router(state: AppState) -> Router {
    Router::new()
        .fallback(proxy_handler)
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::custom(panic_response))
        .with_state(state)
}

/// Recovered panics answer 500 and must never kill the listener
fn panic_response(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = err.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    };
    error!(panic = %detail, "request pipeline panicked");
    Error::internal("panic in request pipeline").into_response()
}

/// The single entry point for every proxied request
async fn proxy_handler(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request<Body>,
) -> Response {
    let remote_addr = addr.to_string();

    let begin = AuditEvent::request_received(
        &state.config.external_address,
        &remote_addr,
        req.method().as_str(),
        req.uri().path(),
    );
    state.audit.emit(begin.clone());

    let outcome = if websocket::is_upgrade_request(req.headers()) {
        websocket::handle(&state, remote_addr, req).await
    } else {
        handle_http(&state, &remote_addr, req).await
    };

    match outcome {
        Ok(PipelineOutcome {
            response,
            user,
            decision,
        }) => {
            state
                .audit
                .emit(begin.completed(user, decision, response.status().as_u16(), None));
            response
        }
        Err(e) => {
            warn!(remote = %begin.remote_addr, path = %begin.path, error = %e, "request rejected");
            let status = e.status().as_u16();
            state
                .audit
                .emit(begin.completed(None, AuditDecision::Rejected, status, Some(e.to_string())));
            e.into_response()
        }
    }
}

/// Plain-HTTP path: authenticate, decide, dispatch
async fn handle_http(
    state: &AppState,
    remote_addr: &str,
    req: Request<Body>,
) -> Result<PipelineOutcome> {
    let (mut parts, body) = req.into_parts();

    let (ctx, user) = resolve_request(state, &mut parts.headers, remote_addr).await?;
    let decision = if ctx.no_impersonation() {
        AuditDecision::Passthrough
    } else {
        AuditDecision::Impersonated
    };

    let response = state
        .dispatcher
        .dispatch(Request::from_parts(parts, body), &ctx)
        .await?;

    Ok(PipelineOutcome {
        response,
        user: Some(user.name),
        decision,
    })
}

/// Authenticate the request and settle its dispatch state.
///
/// On return the header map has been rewritten for the upstream: the
/// client's `Authorization` is stashed in the context and any inbound
/// `Impersonate-*` headers are gone once a decision replaces them. Exactly
/// one of the context's dispatch states is set.
pub(crate) async fn resolve_request(
    state: &AppState,
    headers: &mut HeaderMap,
    remote_addr: &str,
) -> Result<(RequestCtx, AuthenticatedUser)> {
    let token = extract_bearer_token(headers)
        .ok_or(Error::Unauthorized(AuthError::NoToken))?
        .to_string();

    let mut ctx = RequestCtx::new(remote_addr);

    match state.auth.authenticate(&token).await? {
        Authenticated::Passthrough(user) => {
            info!(user = %user.name, remote = %remote_addr, "TokenReview accepted, forwarding token");
            ctx.stash_token(headers);
            ctx.set_no_impersonation();
            Ok((ctx, user))
        }
        Authenticated::Oidc(user) => {
            if state.config.disable_impersonation {
                ctx.stash_token(headers);
                ctx.set_no_impersonation();
                return Ok((ctx, user));
            }

            let impersonated = match ImpersonationRequest::from_headers(headers)? {
                Some(requested) => {
                    let gate = state
                        .gate
                        .as_ref()
                        .ok_or_else(|| Error::internal("impersonation gate not configured"))?;
                    gate.authorize(&user, &requested).await?;
                    info!(
                        user = %user.name,
                        target = %requested.user,
                        remote = %remote_addr,
                        "nested impersonation authorized"
                    );
                    requested.into_user()
                }
                None => user.clone(),
            };

            let client_ip = state
                .config
                .extra_user_header_client_ip
                .then_some(remote_addr);
            let decision = build_decision(
                user.clone(),
                impersonated,
                &state.config.extra_user_headers,
                client_ip,
            )?;

            ctx.stash_token(headers);
            strip_impersonation_headers(headers);
            ctx.set_impersonation(decision);
            Ok((ctx, user))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::time::Duration;

    use jsonwebtoken::{encode, Algorithm, DecodingKey, EncodingKey, Header};

    use crate::auth::oidc::{OidcAuthenticator, OidcOptions};
    use crate::proxy::transport::{MockUpstreamTransport, UpstreamTransport, WsCredentials};

    const ISSUER: &str = "https://issuer.test";
    const CLIENT_ID: &str = "proxy-client";
    const SECRET: &[u8] = b"pipeline-test-secret";

    fn oidc() -> Arc<OidcAuthenticator> {
        let opts = OidcOptions {
            issuer_url: ISSUER.to_string(),
            client_id: CLIENT_ID.to_string(),
            signing_algs: vec![Algorithm::HS256],
            ..Default::default()
        };
        let mut keys = std::collections::HashMap::new();
        keys.insert("test".to_string(), DecodingKey::from_secret(SECRET));
        Arc::new(OidcAuthenticator::with_static_keys(opts, keys))
    }

    fn token_for(sub: &str, groups: &[&str]) -> String {
        let claims = serde_json::json!({
            "iss": ISSUER,
            "aud": CLIENT_ID,
            "sub": sub,
            "groups": groups,
            "exp": chrono::Utc::now().timestamp() + 3600,
        });
        let mut header = Header::new(Algorithm::HS256);
        header.kid = Some("test".to_string());
        encode(&header, &claims, &EncodingKey::from_secret(SECRET)).unwrap()
    }

    fn state_with(
        privileged: MockUpstreamTransport,
        anonymous: Option<MockUpstreamTransport>,
        config: ProxyConfig,
    ) -> AppState {
        let (audit, _writer) = AuditSink::start(None);
        let anonymous: Option<Arc<dyn UpstreamTransport>> =
            anonymous.map(|a| Arc::new(a) as Arc<dyn UpstreamTransport>);
        let privileged: Arc<dyn UpstreamTransport> = Arc::new(privileged);

        AppState {
            auth: Arc::new(AuthChain::new(oidc(), None)),
            gate: None,
            dispatcher: Arc::new(UpstreamDispatcher::new(
                privileged.clone(),
                anonymous.clone(),
                Duration::ZERO,
            )),
            transports: Arc::new(UpstreamTransports {
                privileged,
                anonymous,
                base_url: http::Uri::from_static("https://api.cluster.test:6443"),
                ws: WsCredentials {
                    privileged_tls: Arc::new(
                        rustls::ClientConfig::builder_with_provider(Arc::new(
                            rustls::crypto::aws_lc_rs::default_provider(),
                        ))
                        .with_safe_default_protocol_versions()
                        .unwrap()
                        .with_root_certificates(rustls::RootCertStore::empty())
                        .with_no_client_auth(),
                    ),
                    anonymous_tls: None,
                    bearer: None,
                },
            }),
            audit,
            config: Arc::new(config),
        }
    }

    fn request(token: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().method("GET").uri("/api/v1/pods");
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {}", token));
        }
        builder.body(Body::empty()).unwrap()
    }

    // =========================================================================
    // Scenario: happy OIDC
    // =========================================================================

    #[tokio::test]
    async fn test_valid_jwt_is_impersonated_upstream() {
        let mut privileged = MockUpstreamTransport::new();
        privileged.expect_round_trip().returning(|req| {
            assert!(req.headers().get("authorization").is_none());
            assert_eq!(req.headers().get("impersonate-user").unwrap(), "alice");
            let groups: Vec<_> = req
                .headers()
                .get_all("impersonate-group")
                .iter()
                .map(|v| v.to_str().unwrap().to_string())
                .collect();
            assert_eq!(groups, vec!["dev", "ops"]);
            Ok(Response::new(Body::empty()))
        });

        let state = state_with(privileged, None, ProxyConfig::default());
        let outcome = handle_http(
            &state,
            "10.0.0.9:4100",
            request(Some(&token_for("alice", &["ops", "dev"]))),
        )
        .await
        .unwrap();

        assert_eq!(outcome.response.status(), http::StatusCode::OK);
        assert_eq!(outcome.user.as_deref(), Some("alice"));
        assert!(matches!(outcome.decision, AuditDecision::Impersonated));
    }

    // =========================================================================
    // Scenario: disable impersonation
    // =========================================================================

    #[tokio::test]
    async fn test_disable_impersonation_forwards_token_verbatim() {
        let mut privileged = MockUpstreamTransport::new();
        privileged.expect_round_trip().never();

        let mut anonymous = MockUpstreamTransport::new();
        anonymous.expect_round_trip().returning(|req| {
            let auth = req.headers().get("authorization").unwrap().to_str().unwrap();
            assert!(auth.starts_with("Bearer "));
            assert!(req.headers().get("impersonate-user").is_none());
            assert!(req.headers().get("impersonate-group").is_none());
            Ok(Response::new(Body::empty()))
        });

        let config = ProxyConfig {
            disable_impersonation: true,
            ..Default::default()
        };
        let state = state_with(privileged, Some(anonymous), config);

        let outcome = handle_http(
            &state,
            "10.0.0.9:4100",
            request(Some(&token_for("alice", &["dev"]))),
        )
        .await
        .unwrap();

        assert!(matches!(outcome.decision, AuditDecision::Passthrough));
    }

    // =========================================================================
    // Scenario: TokenReview passthrough
    // =========================================================================

    #[tokio::test]
    async fn test_token_review_fallback_forwards_token_without_impersonation() {
        use crate::auth::token_review::MockTokenAuthenticator;

        let mut privileged = MockUpstreamTransport::new();
        privileged.expect_round_trip().never();

        let mut anonymous = MockUpstreamTransport::new();
        anonymous.expect_round_trip().returning(|req| {
            assert_eq!(
                req.headers().get("authorization").unwrap(),
                "Bearer opaque-sa-token"
            );
            assert!(req.headers().get("impersonate-user").is_none());
            Ok(Response::new(Body::empty()))
        });

        let mut reviewer = MockTokenAuthenticator::new();
        reviewer.expect_review().returning(|token| {
            assert_eq!(token, "opaque-sa-token");
            Ok(AuthenticatedUser::named(
                "system:serviceaccount:default:builder",
            ))
        });

        let mut state = state_with(privileged, Some(anonymous), ProxyConfig::default());
        state.auth = Arc::new(AuthChain::new(oidc(), Some(Arc::new(reviewer))));

        let outcome = handle_http(&state, "10.0.0.9:4100", request(Some("opaque-sa-token")))
            .await
            .unwrap();

        assert!(matches!(outcome.decision, AuditDecision::Passthrough));
        assert_eq!(
            outcome.user.as_deref(),
            Some("system:serviceaccount:default:builder")
        );
    }

    #[tokio::test]
    async fn test_token_review_rejection_is_401() {
        use crate::auth::token_review::MockTokenAuthenticator;

        let mut privileged = MockUpstreamTransport::new();
        privileged.expect_round_trip().never();

        let mut reviewer = MockTokenAuthenticator::new();
        reviewer.expect_review().returning(|_| {
            Err(Error::Unauthorized(AuthError::BadToken(
                "token not authenticated".into(),
            )))
        });

        let mut state = state_with(privileged, None, ProxyConfig::default());
        state.auth = Arc::new(AuthChain::new(oidc(), Some(Arc::new(reviewer))));

        let err = handle_http(&state, "10.0.0.9:4100", request(Some("opaque-sa-token")))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unauthorized(_)));
    }

    // =========================================================================
    // Rejections
    // =========================================================================

    #[tokio::test]
    async fn test_missing_token_is_401_and_never_dispatched() {
        let mut privileged = MockUpstreamTransport::new();
        privileged.expect_round_trip().never();

        let state = state_with(privileged, None, ProxyConfig::default());
        let err = handle_http(&state, "10.0.0.9:4100", request(None))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Unauthorized(AuthError::NoToken)));
    }

    #[tokio::test]
    async fn test_opaque_token_without_fallback_is_401() {
        let mut privileged = MockUpstreamTransport::new();
        privileged.expect_round_trip().never();

        let state = state_with(privileged, None, ProxyConfig::default());
        let err = handle_http(&state, "10.0.0.9:4100", request(Some("opaque-sa-token")))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Unauthorized(AuthError::BadToken(_))));
    }

    // =========================================================================
    // Header composition knobs
    // =========================================================================

    #[tokio::test]
    async fn test_configured_extras_and_client_ip_headers() {
        let mut privileged = MockUpstreamTransport::new();
        privileged.expect_round_trip().returning(|req| {
            assert_eq!(req.headers().get("impersonate-extra-org").unwrap(), "acme");
            assert_eq!(
                req.headers()
                    .get("impersonate-extra-remote-client-ip")
                    .unwrap(),
                "10.0.0.9:4100"
            );
            Ok(Response::new(Body::empty()))
        });

        let mut extra = BTreeMap::new();
        extra.insert("org".to_string(), vec!["acme".to_string()]);
        let config = ProxyConfig {
            extra_user_headers: extra,
            extra_user_header_client_ip: true,
            ..Default::default()
        };

        let state = state_with(privileged, None, config);
        handle_http(
            &state,
            "10.0.0.9:4100",
            request(Some(&token_for("alice", &[]))),
        )
        .await
        .unwrap();
    }

    // =========================================================================
    // Inbound impersonation headers
    // =========================================================================

    #[tokio::test]
    async fn test_nested_impersonation_allowed_targets_nested_identity() {
        use crate::auth::access_review::MockImpersonationAuthorizer;

        let mut privileged = MockUpstreamTransport::new();
        privileged.expect_round_trip().returning(|req| {
            // the nested target, asserted from the privileged transport
            assert_eq!(req.headers().get("impersonate-user").unwrap(), "bob");
            assert!(req.headers().get("authorization").is_none());
            Ok(Response::new(Body::empty()))
        });

        let mut gate = MockImpersonationAuthorizer::new();
        gate.expect_authorize().returning(|inbound, requested| {
            assert_eq!(inbound.name, "alice");
            assert_eq!(requested.user, "bob");
            Ok(())
        });

        let mut state = state_with(privileged, None, ProxyConfig::default());
        state.gate = Some(Arc::new(gate));

        let mut req = request(Some(&token_for("alice", &["dev"])));
        req.headers_mut()
            .insert("impersonate-user", "bob".parse().unwrap());

        let outcome = handle_http(&state, "10.0.0.9:4100", req).await.unwrap();
        // the authenticated user, not the nested target, is audited
        assert_eq!(outcome.user.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn test_nested_impersonation_denied_is_403_without_upstream_contact() {
        use crate::auth::access_review::MockImpersonationAuthorizer;

        let mut privileged = MockUpstreamTransport::new();
        privileged.expect_round_trip().never();

        let mut gate = MockImpersonationAuthorizer::new();
        gate.expect_authorize()
            .returning(|_, _| Err(Error::Forbidden("alice may not impersonate bob".into())));

        let mut state = state_with(privileged, None, ProxyConfig::default());
        state.gate = Some(Arc::new(gate));

        let mut req = request(Some(&token_for("alice", &["dev"])));
        req.headers_mut()
            .insert("impersonate-user", "bob".parse().unwrap());

        let err = handle_http(&state, "10.0.0.9:4100", req).await.unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_inbound_impersonation_without_gate_is_internal_error() {
        // Impersonation enabled but no gate wired: the pipeline must fail
        // closed rather than forward unchecked impersonation.
        let mut privileged = MockUpstreamTransport::new();
        privileged.expect_round_trip().never();

        let state = state_with(privileged, None, ProxyConfig::default());

        let mut req = request(Some(&token_for("alice", &["dev"])));
        req.headers_mut()
            .insert("impersonate-user", "bob".parse().unwrap());

        let err = handle_http(&state, "10.0.0.9:4100", req).await.unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }

    #[tokio::test]
    async fn test_malformed_impersonation_headers_rejected() {
        let mut privileged = MockUpstreamTransport::new();
        privileged.expect_round_trip().never();

        let state = state_with(privileged, None, ProxyConfig::default());

        let mut req = request(Some(&token_for("alice", &["dev"])));
        req.headers_mut()
            .insert("impersonate-group", "dev".parse().unwrap());

        let err = handle_http(&state, "10.0.0.9:4100", req).await.unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)));
    }

    #[tokio::test]
    async fn test_impersonation_headers_pass_through_when_impersonation_disabled() {
        // Under --disable-impersonation the upstream authorizes the
        // client's own impersonation headers; the proxy forwards them.
        let mut privileged = MockUpstreamTransport::new();
        privileged.expect_round_trip().never();

        let mut anonymous = MockUpstreamTransport::new();
        anonymous.expect_round_trip().returning(|req| {
            assert_eq!(req.headers().get("impersonate-user").unwrap(), "bob");
            Ok(Response::new(Body::empty()))
        });

        let config = ProxyConfig {
            disable_impersonation: true,
            ..Default::default()
        };
        let state = state_with(privileged, Some(anonymous), config);

        let mut req = request(Some(&token_for("alice", &["dev"])));
        req.headers_mut()
            .insert("impersonate-user", "bob".parse().unwrap());

        handle_http(&state, "10.0.0.9:4100", req).await.unwrap();
    }
}
