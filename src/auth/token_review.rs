//! Token validation via the upstream TokenReview API
//!
//! Fallback authenticator for tokens the OIDC validator does not recognise
//! (typically ServiceAccount tokens). The review is submitted with the
//! proxy's own credentials; on success the upstream's answer is treated as
//! authoritative and the request is forwarded as passthrough.

use async_trait::async_trait;
use k8s_openapi::api::authentication::v1::{TokenReview, TokenReviewSpec, TokenReviewStatus};
use kube::api::PostParams;
use kube::{Api, Client};
use tracing::debug;

use crate::auth::AuthenticatedUser;
use crate::error::{AuthError, Error, Result};

/// Token authenticator delegating to the upstream
///
/// Trait-shaped so the pipeline can be exercised against canned reviews.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TokenAuthenticator: Send + Sync {
    /// Submit the raw token for review and return the identity it maps to
    async fn review(&self, token: &str) -> Result<AuthenticatedUser>;
}

/// TokenReview-based authenticator
pub struct TokenReviewer {
    client: Client,
    audiences: Option<Vec<String>>,
}

impl TokenReviewer {
    /// Reviewer submitting with the given client's credentials
    pub fn new(client: Client) -> Self {
        Self {
            client,
            audiences: None,
        }
    }

    /// Reviewer that additionally requires one of the given audiences
    pub fn with_audiences(client: Client, audiences: Vec<String>) -> Self {
        Self {
            client,
            audiences: Some(audiences),
        }
    }
}

#[async_trait]
impl TokenAuthenticator for TokenReviewer {
    /// `authenticated=false` is a 401; a failure to reach the upstream is a
    /// 502 so clients can tell credential problems from infrastructure
    /// problems.
    async fn review(&self, token: &str) -> Result<AuthenticatedUser> {
        let api: Api<TokenReview> = Api::all(self.client.clone());

        let review = TokenReview {
            metadata: Default::default(),
            spec: TokenReviewSpec {
                token: Some(token.to_string()),
                audiences: self.audiences.clone(),
            },
            status: None,
        };

        let result = api
            .create(&PostParams::default(), &review)
            .await
            .map_err(|e| Error::Upstream(format!("TokenReview call failed: {}", e)))?;

        let status = result
            .status
            .ok_or_else(|| Error::Upstream("TokenReview returned no status".to_string()))?;

        user_from_status(status)
    }
}

/// Extract the authenticated identity from a TokenReview status
fn user_from_status(status: TokenReviewStatus) -> Result<AuthenticatedUser> {
    if !status.authenticated.unwrap_or(false) {
        let reason = status
            .error
            .unwrap_or_else(|| "token not authenticated".to_string());
        return Err(Error::Unauthorized(AuthError::BadToken(reason)));
    }

    let user = status
        .user
        .ok_or_else(|| Error::Upstream("TokenReview authenticated without user info".to_string()))?;

    let name = user
        .username
        .filter(|n| !n.is_empty())
        .ok_or(AuthError::NoName)?;

    debug!(user = %name, "TokenReview accepted token");

    Ok(AuthenticatedUser {
        name,
        uid: user.uid,
        groups: user.groups.unwrap_or_default(),
        extra: user.extra.unwrap_or_default(),
    })
}
