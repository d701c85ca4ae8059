//! Runtime proxy configuration
//!
//! [`ProxyConfig`] is assembled once from the CLI in `main` and shared
//! read-only across all requests.

use std::collections::BTreeMap;
use std::time::Duration;

/// Behaviour configuration for the request pipeline
///
/// Immutable after construction.
#[derive(Debug, Clone, Default)]
pub struct ProxyConfig {
    /// Forward the original bearer token instead of impersonating
    pub disable_impersonation: bool,

    /// Fall back to the upstream TokenReview API when OIDC does not
    /// recognise the token
    pub token_review: bool,

    /// Cadence for flushing streamed response chunks; zero forwards every
    /// upstream chunk immediately
    pub flush_interval: Duration,

    /// Externally reachable address of this proxy, recorded in audit events
    pub external_address: String,

    /// Additional `Impersonate-Extra-<key>` headers added to every
    /// impersonated request; values are additive and never replace claims
    /// extracted by the authenticator
    pub extra_user_headers: BTreeMap<String, Vec<String>>,

    /// Add `Impersonate-Extra-Remote-Client-IP` carrying the client address
    pub extra_user_header_client_ip: bool,
}

/// Parse a repeatable `key=value` flag argument
///
/// Used for `--oidc-required-claim` and `--extra-user-header`.
pub fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got {:?}", s))?;
    if key.is_empty() {
        return Err(format!("empty key in {:?}", s));
    }
    Ok((key.to_string(), value.to_string()))
}

/// Collect repeated `key=value` pairs into a multimap
///
/// Repeating a key appends to its value list.
pub fn collect_key_values(pairs: &[(String, String)]) -> BTreeMap<String, Vec<String>> {
    let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (key, value) in pairs {
        map.entry(key.clone()).or_default().push(value.clone());
    }
    map
}
