//! Impersonation header composition
//!
//! Builds the `Impersonate-*` header set the privileged transport sends
//! upstream. Composition is a pure function of the impersonated identity,
//! the proxy configuration, and the client address, so the same inputs
//! always produce byte-identical headers: groups are emitted in
//! lexicographic order and extra keys are lower-cased and percent-escaped
//! into the header-name space the API server reserves for them.

use std::collections::BTreeMap;

use http::header::{HeaderName, HeaderValue};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

use crate::auth::AuthenticatedUser;
use crate::error::{Error, Result};

/// `Impersonate-User` header
pub const IMPERSONATE_USER: HeaderName = HeaderName::from_static("impersonate-user");
/// `Impersonate-Group` header
pub const IMPERSONATE_GROUP: HeaderName = HeaderName::from_static("impersonate-group");
/// `Impersonate-Uid` header
pub const IMPERSONATE_UID: HeaderName = HeaderName::from_static("impersonate-uid");
/// Prefix of `Impersonate-Extra-<key>` headers
pub const IMPERSONATE_EXTRA_PREFIX: &str = "impersonate-extra-";

/// Extra key carrying the client address when enabled
pub const CLIENT_IP_EXTRA_KEY: &str = "Remote-Client-IP";

/// Unreserved characters survive escaping; everything else is percent-encoded
const ESCAPE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// The outcome of the impersonation step for one request
#[derive(Debug, Clone)]
pub struct ImpersonationDecision {
    /// Identity that authenticated to the proxy
    pub inbound: AuthenticatedUser,
    /// Identity asserted upstream (differs from `inbound` only for
    /// authorized nested impersonation)
    pub impersonated: AuthenticatedUser,
    /// Fully composed headers, in emission order
    pub headers: Vec<(HeaderName, HeaderValue)>,
}

/// Compose the impersonation decision for a request.
///
/// `extra_user_headers` values are additive: they append further
/// `Impersonate-Extra-*` headers and never replace attributes extracted by
/// the authenticator.
pub fn build_decision(
    inbound: AuthenticatedUser,
    impersonated: AuthenticatedUser,
    extra_user_headers: &BTreeMap<String, Vec<String>>,
    client_ip: Option<&str>,
) -> Result<ImpersonationDecision> {
    let mut headers = Vec::new();

    headers.push((IMPERSONATE_USER, header_value(&impersonated.name)?));

    if let Some(uid) = &impersonated.uid {
        headers.push((IMPERSONATE_UID, header_value(uid)?));
    }

    let mut groups = impersonated.groups.clone();
    groups.sort();
    for group in &groups {
        headers.push((IMPERSONATE_GROUP, header_value(group)?));
    }

    for (key, values) in &impersonated.extra {
        for value in values {
            headers.push((extra_header_name(key)?, header_value(value)?));
        }
    }

    for (key, values) in extra_user_headers {
        for value in values {
            headers.push((extra_header_name(key)?, header_value(value)?));
        }
    }

    if let Some(ip) = client_ip {
        headers.push((extra_header_name(CLIENT_IP_EXTRA_KEY)?, header_value(ip)?));
    }

    Ok(ImpersonationDecision {
        inbound,
        impersonated,
        headers,
    })
}

/// `Impersonate-Extra-<key>` with the key lower-cased and percent-escaped
fn extra_header_name(key: &str) -> Result<HeaderName> {
    let escaped = utf8_percent_encode(&key.to_lowercase(), ESCAPE).to_string();
    HeaderName::from_bytes(format!("{}{}", IMPERSONATE_EXTRA_PREFIX, escaped).as_bytes())
        .map_err(|e| Error::internal(format!("unrepresentable extra header key {:?}: {}", key, e)))
}

/// Header value, percent-escaped when the raw string is not a legal value
fn header_value(value: &str) -> Result<HeaderValue> {
    if let Ok(v) = HeaderValue::from_str(value) {
        return Ok(v);
    }
    let escaped = utf8_percent_encode(value, ESCAPE).to_string();
    HeaderValue::from_str(&escaped)
        .map_err(|e| Error::internal(format!("unrepresentable header value: {}", e)))
}

/// Remove every inbound `Impersonate-*` header.
///
/// Called after the decision is built so a client can never smuggle its own
/// impersonation past the gate.
pub fn strip_impersonation_headers(headers: &mut http::HeaderMap) {
    let names: Vec<HeaderName> = headers
        .keys()
        .filter(|n| is_impersonation_header(n))
        .cloned()
        .collect();
    for name in names {
        headers.remove(&name);
    }
}

fn is_impersonation_header(name: &HeaderName) -> bool {
    *name == IMPERSONATE_USER
        || *name == IMPERSONATE_GROUP
        || *name == IMPERSONATE_UID
        || name.as_str().starts_with(IMPERSONATE_EXTRA_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> AuthenticatedUser {
        AuthenticatedUser {
            name: "alice".to_string(),
            uid: None,
            groups: vec!["ops".to_string(), "dev".to_string()],
            extra: BTreeMap::new(),
        }
    }

    fn names(decision: &ImpersonationDecision) -> Vec<(&str, &str)> {
        decision
            .headers
            .iter()
            .map(|(n, v)| (n.as_str(), v.to_str().unwrap()))
            .collect()
    }

    // =========================================================================
    // Composition
    // =========================================================================

    #[test]
    fn test_groups_sorted_lexicographically() {
        let decision =
            build_decision(alice(), alice(), &BTreeMap::new(), None).unwrap();

        assert_eq!(
            names(&decision),
            vec![
                ("impersonate-user", "alice"),
                ("impersonate-group", "dev"),
                ("impersonate-group", "ops"),
            ]
        );
    }

    #[test]
    fn test_uid_emitted_when_present() {
        let mut user = alice();
        user.uid = Some("uid-42".to_string());
        let decision = build_decision(user.clone(), user, &BTreeMap::new(), None).unwrap();

        assert!(names(&decision).contains(&("impersonate-uid", "uid-42")));
    }

    #[test]
    fn test_extra_keys_lowercased_and_escaped() {
        let mut user = alice();
        user.groups.clear();
        user.extra
            .insert("Acme.com/Project".to_string(), vec!["web".to_string()]);
        let decision = build_decision(user.clone(), user, &BTreeMap::new(), None).unwrap();

        assert_eq!(
            names(&decision),
            vec![
                ("impersonate-user", "alice"),
                ("impersonate-extra-acme.com%2fproject", "web"),
            ]
        );
    }

    #[test]
    fn test_configured_extra_headers_are_additive() {
        let mut user = alice();
        user.groups.clear();
        user.extra
            .insert("scopes".to_string(), vec!["view".to_string()]);

        let mut configured = BTreeMap::new();
        configured.insert("scopes".to_string(), vec!["deploy".to_string()]);
        configured.insert("org".to_string(), vec!["acme".to_string()]);

        let decision = build_decision(user.clone(), user, &configured, None).unwrap();

        // claim-derived extras come first, configured values append
        assert_eq!(
            names(&decision),
            vec![
                ("impersonate-user", "alice"),
                ("impersonate-extra-scopes", "view"),
                ("impersonate-extra-org", "acme"),
                ("impersonate-extra-scopes", "deploy"),
            ]
        );
    }

    #[test]
    fn test_client_ip_header() {
        let decision = build_decision(
            alice(),
            alice(),
            &BTreeMap::new(),
            Some("192.0.2.44:55100"),
        )
        .unwrap();

        assert!(names(&decision)
            .contains(&("impersonate-extra-remote-client-ip", "192.0.2.44:55100")));
    }

    #[test]
    fn test_composition_is_pure() {
        let mut configured = BTreeMap::new();
        configured.insert("org".to_string(), vec!["acme".to_string()]);

        let a = build_decision(alice(), alice(), &configured, Some("10.1.2.3:4")).unwrap();
        let b = build_decision(alice(), alice(), &configured, Some("10.1.2.3:4")).unwrap();

        assert_eq!(names(&a), names(&b));
    }

    #[test]
    fn test_nested_identity_composes_from_target() {
        let bob = AuthenticatedUser::named("bob");
        let decision = build_decision(alice(), bob, &BTreeMap::new(), None).unwrap();

        assert_eq!(names(&decision), vec![("impersonate-user", "bob")]);
        assert_eq!(decision.inbound.name, "alice");
        assert_eq!(decision.impersonated.name, "bob");
    }

    // =========================================================================
    // Inbound header handling
    // =========================================================================

    #[test]
    fn test_strip_impersonation_headers_keeps_the_rest() {
        let mut headers = http::HeaderMap::new();
        headers.insert("impersonate-user", "bob".parse().unwrap());
        headers.append("impersonate-group", "dev".parse().unwrap());
        headers.insert("impersonate-uid", "u-1".parse().unwrap());
        headers.insert("impersonate-extra-scopes", "deploy".parse().unwrap());
        headers.insert("accept", "application/json".parse().unwrap());

        strip_impersonation_headers(&mut headers);

        assert!(!headers.keys().any(|n| n.as_str().starts_with("impersonate-")));
        assert_eq!(headers.get("accept").unwrap(), "application/json");
    }
}
