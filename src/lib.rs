//! kube-identity-proxy — OIDC-to-impersonation reverse proxy for Kubernetes
//!
//! Sits in front of a Kubernetes API server that has no OIDC configuration
//! and converts end-user OIDC bearer tokens into user-impersonation
//! headers. The proxy validates the JWT itself, then re-issues the request
//! under its own service-account or client-certificate credentials with
//! `Impersonate-User` / `Impersonate-Group` / `Impersonate-Extra-*` headers
//! asserting the original caller's identity.
//!
//! # Architecture
//!
//! ```text
//! kubectl ──► auth pipeline ──► impersonating dispatcher ──► K8s API server
//!             (OIDC / TokenReview,    (privileged or
//!              SAR impersonation gate)  anonymous transport)
//! ```
//!
//! # Modules
//!
//! - [`auth`] - OIDC validation, TokenReview fallback, impersonation gate
//! - [`proxy`] - request pipeline, context carrier, transports, dispatch,
//!   WebSocket forwarding
//! - [`audit`] - append-only request audit trail
//! - [`config`] - runtime configuration
//! - [`server`] - TLS listener and graceful shutdown
//! - [`hooks`] - pre-shutdown hook registry
//! - [`retry`] - bounded backoff for JWKS fetches
//! - [`error`] - failure taxonomy and the HTTP error responder

#![deny(missing_docs)]

pub mod audit;
pub mod auth;
pub mod config;
pub mod error;
pub mod hooks;
pub mod proxy;
pub mod retry;
pub mod server;

pub use error::{AuthError, Error, Result};
