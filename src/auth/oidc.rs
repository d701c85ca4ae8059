//! OIDC bearer-token authentication
//!
//! Validates JWTs against a single configured issuer: signature via the
//! issuer's JWKS, then `iss`, `aud`, `exp`, `nbf`, any required claims, and
//! finally username/groups extraction with optional prefixes.
//!
//! # JWKS cache
//!
//! Keys are fetched lazily through OIDC discovery and cached. A refresh is
//! triggered by a cold cache, an expired cache, or an unknown `kid` (key
//! rotation). Refreshes are single-flighted behind a mutex and retried with
//! backoff; persistent failure surfaces as the issuer-unreachable auth
//! error. The CA bundle for the issuer connection is pulled from a
//! [`CaBundleProvider`] on every refresh, so rotation of the file on disk
//! is observed without a restart.
//!
//! # Outcome model
//!
//! Authentication is three-valued: a token that is not a JWT carrying an
//! `iss` claim is a *no-match* (candidate for the TokenReview fallback); a
//! well-formed JWT that fails any check is a *reject*; otherwise the caller
//! gets the authenticated user.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::auth::AuthenticatedUser;
use crate::error::{AuthError, Error, Result};
use crate::retry::{with_backoff, Backoff};

/// Supplier of the current PEM bundle used to trust the issuer endpoint
///
/// Implementations are called on every JWKS refresh; returning `None` means
/// the system trust roots are used.
pub trait CaBundleProvider: Send + Sync {
    /// Current PEM bytes, or `None` when no custom bundle is configured
    fn current_ca_bundle(&self) -> Option<Vec<u8>>;
}

/// File-backed CA bundle provider, re-read on demand
pub struct CaFromFile {
    path: PathBuf,
}

impl CaFromFile {
    /// Provider reading the bundle from `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl CaBundleProvider for CaFromFile {
    fn current_ca_bundle(&self) -> Option<Vec<u8>> {
        match std::fs::read(&self.path) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to read OIDC CA bundle");
                None
            }
        }
    }
}

/// Provider used when no `--oidc-ca-file` is given
pub struct SystemTrust;

impl CaBundleProvider for SystemTrust {
    fn current_ca_bundle(&self) -> Option<Vec<u8>> {
        None
    }
}

/// OIDC authenticator configuration
#[derive(Clone, Debug)]
pub struct OidcOptions {
    /// Issuer URL; the token's `iss` claim must match exactly
    pub issuer_url: String,
    /// Expected audience (`aud` claim)
    pub client_id: String,
    /// Claim holding the username
    pub username_claim: String,
    /// Prefix prepended to extracted usernames
    pub username_prefix: Option<String>,
    /// Claim holding the group list (string or array of strings)
    pub groups_claim: String,
    /// Prefix prepended to each extracted group
    pub groups_prefix: Option<String>,
    /// Claims that must be present and equal the configured value
    pub required_claims: BTreeMap<String, String>,
    /// Accepted signature algorithms
    pub signing_algs: Vec<Algorithm>,
    /// Maximum JWKS cache age before a background-of-request refresh
    pub jwks_refresh_interval: Duration,
}

impl Default for OidcOptions {
    fn default() -> Self {
        Self {
            issuer_url: String::new(),
            client_id: String::new(),
            username_claim: "sub".to_string(),
            username_prefix: None,
            groups_claim: "groups".to_string(),
            groups_prefix: None,
            required_claims: BTreeMap::new(),
            signing_algs: vec![Algorithm::RS256],
            jwks_refresh_interval: Duration::from_secs(3600),
        }
    }
}

/// Result of an OIDC authentication attempt that did not reject the request
#[derive(Debug)]
pub enum OidcOutcome {
    /// Token validated; identity extracted
    Authenticated(AuthenticatedUser),
    /// Token is not a JWT for this issuer; another authenticator may claim it
    NoMatch,
}

/// Cached JWKS material
struct CachedKeys {
    keys: HashMap<String, DecodingKey>,
    fetched_at: Instant,
}

/// OIDC discovery document
#[derive(Debug, Deserialize)]
struct Discovery {
    issuer: String,
    jwks_uri: String,
}

/// JWKS document
#[derive(Debug, Deserialize)]
struct JwksDocument {
    keys: Vec<Jwk>,
}

/// Individual JWK entry
#[derive(Debug, Deserialize)]
struct Jwk {
    kty: String,
    kid: Option<String>,
    /// RSA modulus
    n: Option<String>,
    /// RSA exponent
    e: Option<String>,
    /// EC curve
    crv: Option<String>,
    /// EC x coordinate
    x: Option<String>,
    /// EC y coordinate
    y: Option<String>,
}

/// OIDC token authenticator
pub struct OidcAuthenticator {
    opts: OidcOptions,
    ca: Arc<dyn CaBundleProvider>,
    jwks: RwLock<Option<CachedKeys>>,
    refresh_gate: Mutex<()>,
    backoff: Backoff,
}

impl std::fmt::Debug for OidcAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OidcAuthenticator").finish_non_exhaustive()
    }
}

impl OidcAuthenticator {
    /// Create an authenticator for the configured issuer
    pub fn new(opts: OidcOptions, ca: Arc<dyn CaBundleProvider>) -> Result<Self> {
        if opts.issuer_url.is_empty() {
            return Err(Error::config("OIDC issuer URL must be set"));
        }
        if opts.client_id.is_empty() {
            return Err(Error::config("OIDC client id must be set"));
        }
        if opts.signing_algs.is_empty() {
            return Err(Error::config("at least one OIDC signing algorithm is required"));
        }

        Ok(Self {
            opts,
            ca,
            jwks: RwLock::new(None),
            refresh_gate: Mutex::new(()),
            backoff: Backoff::default(),
        })
    }

    /// Authenticator seeded with fixed keys, for tests
    #[cfg(test)]
    pub(crate) fn with_static_keys(opts: OidcOptions, keys: HashMap<String, DecodingKey>) -> Self {
        Self {
            opts,
            ca: Arc::new(SystemTrust),
            jwks: RwLock::new(Some(CachedKeys {
                keys,
                fetched_at: Instant::now(),
            })),
            refresh_gate: Mutex::new(()),
            backoff: Backoff {
                attempts: 1,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(1),
            },
        }
    }

    /// Validate a bearer token.
    ///
    /// Returns [`OidcOutcome::NoMatch`] when the token cannot be a JWT for
    /// this issuer, `Err` on any definite reject.
    pub async fn authenticate(&self, token: &str) -> Result<OidcOutcome> {
        // A token without a parseable payload or without an `iss` claim is
        // not ours to judge.
        let Some(claims) = unverified_claims(token) else {
            return Ok(OidcOutcome::NoMatch);
        };
        let Some(issuer) = claims.get("iss").and_then(|v| v.as_str()) else {
            return Ok(OidcOutcome::NoMatch);
        };

        // Well-formed JWT from another issuer: definite reject, the
        // TokenReview fallback must not run for it.
        if issuer != self.opts.issuer_url {
            return Err(Error::Unauthorized(AuthError::BadToken(format!(
                "issuer {:?} does not match configured issuer",
                issuer
            ))));
        }

        let header = decode_header(token)
            .map_err(|e| AuthError::BadToken(format!("invalid JWT header: {}", e)))?;

        let key = self.decoding_key(header.kid.as_deref()).await?;

        let mut validation = Validation::new(self.opts.signing_algs[0]);
        validation.algorithms = self.opts.signing_algs.clone();
        validation.set_issuer(&[&self.opts.issuer_url]);
        validation.set_audience(&[&self.opts.client_id]);
        validation.validate_nbf = true;

        let verified = decode::<serde_json::Value>(token, &key, &validation)
            .map_err(|e| AuthError::BadToken(classify_jwt_error(&e)))?
            .claims;

        for (claim, expected) in &self.opts.required_claims {
            let matches = verified
                .get(claim)
                .and_then(|v| v.as_str())
                .map(|v| v == expected)
                .unwrap_or(false);
            if !matches {
                return Err(Error::Unauthorized(AuthError::BadToken(format!(
                    "required claim {:?} missing or mismatched",
                    claim
                ))));
            }
        }

        let user = self.extract_user(&verified)?;
        debug!(user = %user.name, groups = ?user.groups, "validated OIDC token");
        Ok(OidcOutcome::Authenticated(user))
    }

    /// Map verified claims to an identity
    fn extract_user(&self, claims: &serde_json::Value) -> Result<AuthenticatedUser> {
        let raw_name = claims
            .get(&self.opts.username_claim)
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or(AuthError::NoName)?;

        let name = match &self.opts.username_prefix {
            Some(prefix) => format!("{}{}", prefix, raw_name),
            None => raw_name.to_string(),
        };

        let raw_groups = extract_groups(claims, &self.opts.groups_claim);
        let groups = match &self.opts.groups_prefix {
            Some(prefix) => raw_groups
                .into_iter()
                .map(|g| format!("{}{}", prefix, g))
                .collect(),
            None => raw_groups,
        };

        Ok(AuthenticatedUser {
            name,
            uid: None,
            groups,
            extra: BTreeMap::new(),
        })
    }

    /// Look up a decoding key, refreshing the JWKS when the cache is cold,
    /// stale, or does not know the `kid`
    async fn decoding_key(&self, kid: Option<&str>) -> Result<DecodingKey> {
        if let Some(key) = self.cached_key(kid).await {
            return Ok(key);
        }

        self.refresh_jwks().await?;

        self.cached_key(kid).await.ok_or_else(|| {
            Error::Unauthorized(AuthError::BadToken(format!(
                "no key in JWKS for kid {:?}",
                kid
            )))
        })
    }

    /// Fresh-cache lookup; `None` forces a refresh
    async fn cached_key(&self, kid: Option<&str>) -> Option<DecodingKey> {
        let cache = self.jwks.read().await;
        let cache = cache.as_ref()?;
        if cache.fetched_at.elapsed() > self.opts.jwks_refresh_interval {
            return None;
        }
        match kid {
            Some(kid) => cache.keys.get(kid).cloned(),
            None => cache.keys.values().next().cloned(),
        }
    }

    /// Single-flighted JWKS refresh with backoff
    async fn refresh_jwks(&self) -> Result<()> {
        let requested_at = Instant::now();
        let _flight = self.refresh_gate.lock().await;

        // Another request may have completed a refresh while this one
        // waited on the gate.
        {
            let cache = self.jwks.read().await;
            if let Some(cache) = cache.as_ref() {
                if cache.fetched_at >= requested_at {
                    return Ok(());
                }
            }
        }

        let keys = with_backoff(&self.backoff, "jwks_fetch", || self.fetch_jwks())
            .await
            .map_err(|e| Error::Unauthorized(AuthError::IssuerUnreachable(e)))?;

        info!(key_count = keys.len(), "refreshed JWKS cache");

        let mut cache = self.jwks.write().await;
        *cache = Some(CachedKeys {
            keys,
            fetched_at: Instant::now(),
        });
        Ok(())
    }

    /// One discovery + JWKS fetch round trip
    async fn fetch_jwks(&self) -> std::result::Result<HashMap<String, DecodingKey>, String> {
        let client = self.issuer_client()?;

        let discovery_url = format!(
            "{}/.well-known/openid-configuration",
            self.opts.issuer_url.trim_end_matches('/')
        );
        debug!(url = %discovery_url, "fetching OIDC discovery document");

        let discovery: Discovery = client
            .get(&discovery_url)
            .send()
            .await
            .map_err(|e| format!("discovery fetch failed: {}", e))?
            .json()
            .await
            .map_err(|e| format!("invalid discovery document: {}", e))?;

        if discovery.issuer != self.opts.issuer_url {
            return Err(format!(
                "discovery issuer {:?} does not match configured issuer",
                discovery.issuer
            ));
        }

        debug!(url = %discovery.jwks_uri, "fetching JWKS");

        let jwks: JwksDocument = client
            .get(&discovery.jwks_uri)
            .send()
            .await
            .map_err(|e| format!("JWKS fetch failed: {}", e))?
            .json()
            .await
            .map_err(|e| format!("invalid JWKS document: {}", e))?;

        let mut keys = HashMap::new();
        for jwk in jwks.keys {
            if let Some(key) = jwk_to_decoding_key(&jwk)? {
                keys.insert(jwk.kid.unwrap_or_else(|| "default".to_string()), key);
            }
        }

        if keys.is_empty() {
            return Err("no usable keys in JWKS".to_string());
        }
        Ok(keys)
    }

    /// HTTP client trusting the current CA bundle.
    ///
    /// Built per refresh so a rotated bundle takes effect on the next fetch.
    fn issuer_client(&self) -> std::result::Result<reqwest::Client, String> {
        let mut builder = reqwest::Client::builder().timeout(Duration::from_secs(10));

        if let Some(pem) = self.ca.current_ca_bundle() {
            let certs = reqwest::Certificate::from_pem_bundle(&pem)
                .map_err(|e| format!("invalid OIDC CA bundle: {}", e))?;
            for cert in certs {
                builder = builder.add_root_certificate(cert);
            }
        }

        builder
            .build()
            .map_err(|e| format!("failed to build issuer HTTP client: {}", e))
    }
}

/// Decode the payload segment without verifying the signature.
///
/// Only used to decide whether this authenticator should judge the token at
/// all; every claim is re-read from the verified decode.
fn unverified_claims(token: &str) -> Option<serde_json::Value> {
    let mut parts = token.split('.');
    let (_header, payload, _sig) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() {
        return None;
    }
    let bytes = URL_SAFE_NO_PAD.decode(payload).ok()?;
    serde_json::from_slice(&bytes).ok()
}

/// Groups claim accepts a single string or an array of strings
fn extract_groups(claims: &serde_json::Value, groups_claim: &str) -> Vec<String> {
    match claims.get(groups_claim) {
        Some(serde_json::Value::String(s)) => vec![s.clone()],
        Some(serde_json::Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str())
            .map(|s| s.to_string())
            .collect(),
        _ => Vec::new(),
    }
}

/// Stable reject messages for logging; the client only ever sees 401
fn classify_jwt_error(e: &jsonwebtoken::errors::Error) -> String {
    use jsonwebtoken::errors::ErrorKind;

    match e.kind() {
        ErrorKind::InvalidSignature => "signature invalid".to_string(),
        ErrorKind::ExpiredSignature => "token expired".to_string(),
        ErrorKind::ImmatureSignature => "token not yet valid".to_string(),
        ErrorKind::InvalidAudience => "audience mismatch".to_string(),
        ErrorKind::InvalidIssuer => "issuer mismatch".to_string(),
        ErrorKind::InvalidAlgorithm => "signing algorithm not allowed".to_string(),
        other => format!("validation failed: {:?}", other),
    }
}

/// Convert a JWK into a decoding key; unsupported key types are skipped
fn jwk_to_decoding_key(jwk: &Jwk) -> std::result::Result<Option<DecodingKey>, String> {
    match jwk.kty.as_str() {
        "RSA" => {
            let n = jwk.n.as_ref().ok_or("RSA key missing 'n'")?;
            let e = jwk.e.as_ref().ok_or("RSA key missing 'e'")?;
            DecodingKey::from_rsa_components(n, e)
                .map(Some)
                .map_err(|e| format!("invalid RSA key: {}", e))
        }
        "EC" => {
            let crv = jwk.crv.as_ref().ok_or("EC key missing 'crv'")?;
            let x = jwk.x.as_ref().ok_or("EC key missing 'x'")?;
            let y = jwk.y.as_ref().ok_or("EC key missing 'y'")?;
            match crv.as_str() {
                "P-256" | "P-384" => DecodingKey::from_ec_components(x, y)
                    .map(Some)
                    .map_err(|e| format!("invalid EC key: {}", e)),
                other => {
                    warn!(crv = %other, "unsupported EC curve in JWKS");
                    Ok(None)
                }
            }
        }
        other => {
            warn!(kty = %other, "unsupported key type in JWKS");
            Ok(None)
        }
    }
}
