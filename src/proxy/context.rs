//! Per-request context
//!
//! A typed scratch area threaded from authentication to the terminal
//! dispatcher. Exactly one of `no_impersonation` / `impersonation` must be
//! set by the time the request is dispatched; the dispatcher treats any
//! other state as a pipeline bug and answers 500 without contacting the
//! upstream.
//!
//! Reads are idempotent. Writing the same field twice is a programming
//! error and trips a debug assertion.

use http::HeaderMap;

use crate::proxy::headers::ImpersonationDecision;

/// Typed per-request state
#[derive(Debug, Default)]
pub struct RequestCtx {
    remote_addr: String,
    bearer_token: Option<http::HeaderValue>,
    no_impersonation: bool,
    impersonation: Option<ImpersonationDecision>,
}

impl RequestCtx {
    /// Fresh context for a request from `remote_addr`
    pub fn new(remote_addr: impl Into<String>) -> Self {
        Self {
            remote_addr: remote_addr.into(),
            ..Default::default()
        }
    }

    /// Client address the request arrived from
    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    /// Remove the `Authorization` header and remember its raw value.
    ///
    /// Called once after authentication so the privileged transport never
    /// sees the end user's credential. The stored value is only restored by
    /// the passthrough path.
    pub fn stash_token(&mut self, headers: &mut HeaderMap) {
        debug_assert!(self.bearer_token.is_none(), "bearer token stashed twice");
        self.bearer_token = headers.remove(http::header::AUTHORIZATION);
    }

    /// The stashed `Authorization` value, if any
    pub fn bearer_token(&self) -> Option<&http::HeaderValue> {
        self.bearer_token.as_ref()
    }

    /// Mark the request for passthrough dispatch (impersonation disabled or
    /// a positive TokenReview)
    pub fn set_no_impersonation(&mut self) {
        debug_assert!(!self.no_impersonation, "no_impersonation set twice");
        debug_assert!(
            self.impersonation.is_none(),
            "no_impersonation set after an impersonation decision"
        );
        self.no_impersonation = true;
    }

    /// Whether the request is dispatched without impersonation
    pub fn no_impersonation(&self) -> bool {
        self.no_impersonation
    }

    /// Attach the computed impersonation decision
    pub fn set_impersonation(&mut self, decision: ImpersonationDecision) {
        debug_assert!(self.impersonation.is_none(), "impersonation decision set twice");
        debug_assert!(
            !self.no_impersonation,
            "impersonation decision set on a passthrough request"
        );
        self.impersonation = Some(decision);
    }

    /// The impersonation decision, once computed
    pub fn impersonation(&self) -> Option<&ImpersonationDecision> {
        self.impersonation.as_ref()
    }
}
