//! Upstream transport factory
//!
//! Builds the two round-trippers the proxy uses against the API server from
//! a single rest-config:
//!
//! - **privileged** — the full config: its TLS identity rides in the rustls
//!   connector and its bearer credential is injected by the kube auth
//!   layer. Used for every impersonated request.
//! - **anonymous** — a reduced config sharing only the cluster URL, trust
//!   anchors and timeouts. Used when the original bearer token is forwarded
//!   verbatim, so the proxy's own credential can never leak onto a
//!   passthrough request.
//!
//! Both are tower services composed the kube-native way: base-URI layer +
//! optional auth layer over a hyper client with the config's rustls
//! connector. TLS construction failure here is fatal at startup, never
//! per-request.

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use http::{Request, Response, Uri};
use hyper_util::client::legacy::Client as HyperClient;
use hyper_util::rt::TokioExecutor;
use kube::client::ConfigExt;
use secrecy::ExposeSecret;
use tower::util::BoxCloneSyncService;
use tower::{BoxError, ServiceBuilder, ServiceExt};

use crate::error::{Error, Result};

/// Boxed round-tripper service to the API server
pub type HttpService = BoxCloneSyncService<Request<Body>, Response<Body>, BoxError>;

/// A round trip to the upstream API server
///
/// Trait-shaped so the pipeline can be exercised against a mock upstream.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UpstreamTransport: Send + Sync {
    /// Send one request and return the (possibly streaming) response
    async fn round_trip(&self, req: Request<Body>) -> Result<Response<Body>>;
}

/// Production transport backed by the composed tower service
pub struct HttpTransport {
    service: HttpService,
}

#[async_trait]
impl UpstreamTransport for HttpTransport {
    async fn round_trip(&self, req: Request<Body>) -> Result<Response<Body>> {
        self.service
            .clone()
            .oneshot(req)
            .await
            .map_err(|e| Error::upstream(e.to_string()))
    }
}

/// TLS material and credential for WebSocket handshakes
///
/// The HTTP services carry these internally; the WebSocket path dials the
/// upstream itself and needs them directly.
pub struct WsCredentials {
    /// rustls config with the privileged client identity
    pub privileged_tls: Arc<rustls::ClientConfig>,
    /// rustls config with trust anchors only
    pub anonymous_tls: Option<Arc<rustls::ClientConfig>>,
    /// Privileged bearer token, when the rest-config authenticates by token
    pub bearer: Option<String>,
}

/// The shared upstream transports, built once at startup
pub struct UpstreamTransports {
    /// Round-tripper carrying the proxy's credentials
    pub privileged: Arc<dyn UpstreamTransport>,
    /// Credential-free round-tripper for passthrough requests
    pub anonymous: Option<Arc<dyn UpstreamTransport>>,
    /// The API server URL requests are rebased onto
    pub base_url: Uri,
    /// Material for upstream WebSocket handshakes
    pub ws: WsCredentials,
}

impl UpstreamTransports {
    /// Build both transports from the rest-config.
    ///
    /// The anonymous variant is only constructed when a passthrough path
    /// (disabled impersonation or TokenReview) can actually use it.
    pub fn from_config(config: &kube::Config, need_anonymous: bool) -> Result<Self> {
        let privileged = round_tripper(config)?;
        let privileged_tls = Arc::new(
            config
                .rustls_client_config()
                .map_err(|e| Error::config(format!("upstream TLS config: {}", e)))?,
        );

        let (anonymous, anonymous_tls) = if need_anonymous {
            let reduced = anonymous_config(config);
            let tls = Arc::new(
                reduced
                    .rustls_client_config()
                    .map_err(|e| Error::config(format!("anonymous upstream TLS config: {}", e)))?,
            );
            (Some(round_tripper(&reduced)?), Some(tls))
        } else {
            (None, None)
        };

        Ok(Self {
            privileged,
            anonymous,
            base_url: config.cluster_url.clone(),
            ws: WsCredentials {
                privileged_tls,
                anonymous_tls,
                bearer: bearer_credential(config)?,
            },
        })
    }
}

/// Compose one round-tripper for a rest-config
fn round_tripper(config: &kube::Config) -> Result<Arc<dyn UpstreamTransport>> {
    let connector = config
        .rustls_https_connector()
        .map_err(|e| Error::config(format!("upstream TLS connector: {}", e)))?;

    let client: HyperClient<_, Body> = HyperClient::builder(TokioExecutor::new()).build(connector);

    let auth_layer = config
        .auth_layer()
        .map_err(|e| Error::config(format!("upstream auth layer: {}", e)))?;

    let service = ServiceBuilder::new()
        .map_response(|res: Response<hyper::body::Incoming>| res.map(Body::new))
        .layer(config.base_uri_layer())
        .option_layer(auth_layer)
        .map_err(BoxError::from)
        .service(client);

    Ok(Arc::new(HttpTransport {
        service: BoxCloneSyncService::new(service),
    }))
}

/// Reduced config: host, API path, trust and timeouts — no credentials
fn anonymous_config(config: &kube::Config) -> kube::Config {
    let mut reduced = kube::Config::new(config.cluster_url.clone());
    reduced.default_namespace = config.default_namespace.clone();
    reduced.root_cert = config.root_cert.clone();
    reduced.connect_timeout = config.connect_timeout;
    reduced.read_timeout = config.read_timeout;
    reduced.write_timeout = config.write_timeout;
    reduced.accept_invalid_certs = config.accept_invalid_certs;
    reduced.tls_server_name = config.tls_server_name.clone();
    reduced
}

/// The config's bearer token, for handshakes the auth layer cannot wrap.
///
/// Exec-plugin and refresh flows are not supported on the WebSocket path;
/// client-certificate identities need nothing here because they live in the
/// TLS config.
fn bearer_credential(config: &kube::Config) -> Result<Option<String>> {
    if let Some(token) = &config.auth_info.token {
        return Ok(Some(token.expose_secret().to_string()));
    }
    if let Some(path) = &config.auth_info.token_file {
        let token = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("failed to read token file {}: {}", path, e)))?;
        return Ok(Some(token.trim().to_string()));
    }
    Ok(None)
}
