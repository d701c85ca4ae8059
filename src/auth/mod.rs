//! Request authentication
//!
//! The proxy authenticates every request with an ordered chain:
//!
//! 1. OIDC JWT validation ([`oidc`]) — the primary path.
//! 2. Upstream `TokenReview` ([`token_review`]) — optional fallback, tried
//!    only when OIDC reports *no match* (the token is not a JWT for the
//!    configured issuer). A well-formed JWT that fails validation is an
//!    outright reject and never reaches the fallback.
//!
//! Nested impersonation requests are authorized separately by the
//! [`access_review`] gate.

pub mod access_review;
pub mod oidc;
pub mod token_review;

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::http::HeaderMap;
use tracing::debug;

use crate::error::{AuthError, Error, Result};
use self::oidc::{OidcAuthenticator, OidcOutcome};
use self::token_review::TokenAuthenticator;

/// Identity established for one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser {
    /// Username asserted upstream as `Impersonate-User`
    pub name: String,
    /// Stable user id, when the authenticator supplies one
    pub uid: Option<String>,
    /// Group memberships
    pub groups: Vec<String>,
    /// Additional key/value identity attributes
    pub extra: BTreeMap<String, Vec<String>>,
}

impl AuthenticatedUser {
    /// Identity with just a name
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uid: None,
            groups: Vec::new(),
            extra: BTreeMap::new(),
        }
    }
}

/// How a request was authenticated
#[derive(Debug, Clone)]
pub enum Authenticated {
    /// OIDC validated the token; the request will be impersonated unless
    /// impersonation is disabled
    Oidc(AuthenticatedUser),
    /// The upstream TokenReview accepted the token; the request is
    /// forwarded with the original token and no impersonation
    Passthrough(AuthenticatedUser),
}

impl Authenticated {
    /// The authenticated identity, however it was established
    pub fn user(&self) -> &AuthenticatedUser {
        match self {
            Authenticated::Oidc(u) | Authenticated::Passthrough(u) => u,
        }
    }
}

/// Ordered authentication chain: OIDC, then optional TokenReview fallback
pub struct AuthChain {
    oidc: Arc<OidcAuthenticator>,
    token_review: Option<Arc<dyn TokenAuthenticator>>,
}

impl AuthChain {
    /// Build a chain. `token_review` is `Some` when `--token-passthrough`
    /// is set.
    pub fn new(
        oidc: Arc<OidcAuthenticator>,
        token_review: Option<Arc<dyn TokenAuthenticator>>,
    ) -> Self {
        Self { oidc, token_review }
    }

    /// Authenticate a bearer token.
    ///
    /// OIDC rejects map straight to 401. A no-match consults the
    /// TokenReview fallback when enabled, otherwise it is also a 401.
    pub async fn authenticate(&self, token: &str) -> Result<Authenticated> {
        match self.oidc.authenticate(token).await? {
            OidcOutcome::Authenticated(user) => {
                debug!(user = %user.name, "OIDC authentication succeeded");
                Ok(Authenticated::Oidc(user))
            }
            OidcOutcome::NoMatch => match &self.token_review {
                Some(reviewer) => {
                    debug!("token is not an OIDC JWT, trying TokenReview");
                    let user = reviewer.review(token).await?;
                    debug!(user = %user.name, "TokenReview authentication succeeded");
                    Ok(Authenticated::Passthrough(user))
                }
                None => Err(Error::Unauthorized(AuthError::BadToken(
                    "token is not a JWT for the configured issuer".into(),
                ))),
            },
        }
    }
}

/// Extract the bearer token from an `Authorization` header
pub fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .filter(|t| !t.is_empty())
}
