//! Error types for the proxy
//!
//! Every failure on a request path is classified into one of the variants
//! below, and the [`IntoResponse`] impl is the single place where internal
//! failures become HTTP responses. Authentication and authorization
//! failures deliberately answer with opaque bodies; the cause only goes to
//! structured logs and the audit trail.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Result type for proxy operations
pub type Result<T> = std::result::Result<T, Error>;

/// Authentication failure causes
///
/// These all surface as an opaque 401; the variant is what gets logged.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// The request carried no bearer token
    #[error("no bearer token in request")]
    NoToken,

    /// The token was presented but rejected (signature, audience, expiry,
    /// required claim, issuer mismatch, ...)
    #[error("token rejected: {0}")]
    BadToken(String),

    /// The token validated but yielded no username
    #[error("no username claim in token")]
    NoName,

    /// The issuer's key material could not be fetched
    #[error("issuer unreachable: {0}")]
    IssuerUnreachable(String),
}

/// Error type for proxy operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Authentication failed
    #[error("authentication failed: {0}")]
    Unauthorized(#[from] AuthError),

    /// The inbound user may not impersonate the requested identity
    #[error("impersonation denied: {0}")]
    Forbidden(String),

    /// The inbound request is malformed
    #[error("bad request: {0}")]
    BadRequest(String),

    /// A call to the upstream API server failed at the transport level
    #[error("upstream error: {0}")]
    Upstream(String),

    /// Startup configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Pipeline invariant violated
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create an upstream transport error with the given message
    pub fn upstream(msg: impl Into<String>) -> Self {
        Self::Upstream(msg.into())
    }

    /// The HTTP status this error answers with
    pub fn status(&self) -> StatusCode {
        match self {
            Error::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Error::Forbidden(_) => StatusCode::FORBIDDEN,
            Error::BadRequest(_) => StatusCode::BAD_REQUEST,
            Error::Upstream(_) => StatusCode::BAD_GATEWAY,
            Error::Config(_) | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();

        // 401/403 answer with fixed bodies. Anything more specific would
        // leak why a credential was rejected.
        match &self {
            Error::Unauthorized(_) => return (status, "Unauthorized").into_response(),
            Error::Forbidden(_) => return (status, "Forbidden").into_response(),
            _ => {}
        }

        let message = match &self {
            Error::BadRequest(_) | Error::Upstream(_) => self.to_string(),
            _ => "internal error".to_string(),
        };

        // K8s-style Status response so kubectl renders it sensibly
        let body = serde_json::json!({
            "kind": "Status",
            "apiVersion": "v1",
            "status": "Failure",
            "message": message,
            "code": status.as_u16()
        });

        (status, axum::Json(body)).into_response()
    }
}

impl From<kube::Error> for Error {
    fn from(e: kube::Error) -> Self {
        Error::Upstream(e.to_string())
    }
}
