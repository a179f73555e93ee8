//! Signing-key retrieval from a JWKS endpoint.
//!
//! A [`KeySource`] fetches a JSON Web Key Set and normalizes it into a
//! [`KeySet`] of verification keys. [`HttpKeySource`] is the production
//! implementation; tests substitute their own.
//!
//! # Security
//!
//! - Only keys meant for signature verification are admitted
//! - TLS verification can be disabled only when explicitly configured, and
//!   doing so is logged at WARN
//! - The HTTP client carries a request timeout so a stalled endpoint never
//!   blocks callers indefinitely

use crate::errors::FetchError;
use async_trait::async_trait;
use common::jwt::decode_ed25519_public_key_jwk;
use jsonwebtoken::{Algorithm, DecodingKey};
use serde::Deserialize;
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::instrument;

/// Default timeout for a single key-set request.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// JSON Web Key as published by the issuer.
#[derive(Debug, Clone, Deserialize)]
pub struct Jwk {
    /// Key type ("OKP", "RSA" or "EC").
    pub kty: String,

    /// Key ID - keys without one are skipped.
    #[serde(default)]
    pub kid: Option<String>,

    /// Curve name for OKP and EC keys.
    #[serde(default)]
    pub crv: Option<String>,

    /// OKP public key, or EC x coordinate (base64url).
    #[serde(default)]
    pub x: Option<String>,

    /// EC y coordinate (base64url).
    #[serde(default)]
    pub y: Option<String>,

    /// RSA modulus (base64url).
    #[serde(default)]
    pub n: Option<String>,

    /// RSA public exponent (base64url).
    #[serde(default)]
    pub e: Option<String>,

    #[serde(default)]
    pub alg: Option<String>,

    /// Key use; only "sig" (or absent) is accepted.
    #[serde(default, rename = "use")]
    pub key_use: Option<String>,

    /// Not-before timestamp (Unix epoch seconds).
    #[serde(default)]
    pub nbf: Option<i64>,

    /// Expiry timestamp (Unix epoch seconds).
    #[serde(default)]
    pub exp: Option<i64>,
}

/// JWKS document returned by the signing-keys endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct JwksResponse {
    pub keys: Vec<Jwk>,
}

/// Why a published JWK could not be turned into a [`SigningKey`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UnusableKey {
    #[error("key has no kid")]
    MissingKid,

    #[error("key use '{0}' is not 'sig'")]
    NotForSigning(String),

    #[error("unsupported key type '{0}'")]
    UnsupportedKeyType(String),

    #[error("unsupported algorithm '{alg}' for key type '{kty}'")]
    UnsupportedAlgorithm { kty: String, alg: String },

    #[error("invalid key material: {0}")]
    InvalidMaterial(String),
}

/// A verification key admitted from a key set. Never mutated after
/// construction; superseded keys are replaced, not edited.
#[derive(Clone)]
pub struct SigningKey {
    kid: String,
    algorithm: Algorithm,
    decoding_key: DecodingKey,
    not_before: Option<i64>,
    expires_at: Option<i64>,
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey")
            .field("kid", &self.kid)
            .field("algorithm", &self.algorithm)
            .field("not_before", &self.not_before)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

impl SigningKey {
    /// Normalize a published JWK into a verification key.
    ///
    /// # Errors
    ///
    /// Returns [`UnusableKey`] when the key has no `kid`, is not a signing
    /// key, uses an unsupported type or algorithm, or its material cannot
    /// be decoded.
    pub fn from_jwk(jwk: &Jwk) -> Result<Self, UnusableKey> {
        let kid = jwk
            .kid
            .as_deref()
            .filter(|kid| !kid.is_empty())
            .ok_or(UnusableKey::MissingKid)?;

        if let Some(key_use) = jwk.key_use.as_deref() {
            if key_use != "sig" {
                return Err(UnusableKey::NotForSigning(key_use.to_string()));
            }
        }

        let algorithm = resolve_algorithm(jwk)?;
        let decoding_key = build_decoding_key(jwk, algorithm)?;

        Ok(Self {
            kid: kid.to_string(),
            algorithm,
            decoding_key,
            not_before: jwk.nbf,
            expires_at: jwk.exp,
        })
    }

    pub fn kid(&self) -> &str {
        &self.kid
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn decoding_key(&self) -> &DecodingKey {
        &self.decoding_key
    }

    /// Whether `now` (Unix seconds) falls inside the key's validity window.
    pub fn is_valid_at(&self, now: i64) -> bool {
        self.not_before.map_or(true, |nbf| now >= nbf)
            && self.expires_at.map_or(true, |exp| now < exp)
    }
}

/// Pick the algorithm a JWK verifies, defaulting from its type and curve.
fn resolve_algorithm(jwk: &Jwk) -> Result<Algorithm, UnusableKey> {
    let unsupported = |alg: &str| UnusableKey::UnsupportedAlgorithm {
        kty: jwk.kty.clone(),
        alg: alg.to_string(),
    };

    let declared = jwk
        .alg
        .as_deref()
        .map(|alg| Algorithm::from_str(alg).map_err(|_| unsupported(alg)))
        .transpose()?;

    match jwk.kty.as_str() {
        "OKP" => {
            if jwk.crv.as_deref().is_some_and(|crv| crv != "Ed25519") {
                return Err(UnusableKey::UnsupportedKeyType(format!(
                    "OKP/{}",
                    jwk.crv.as_deref().unwrap_or_default()
                )));
            }
            match declared {
                None | Some(Algorithm::EdDSA) => Ok(Algorithm::EdDSA),
                Some(other) => Err(unsupported(&format!("{other:?}"))),
            }
        }
        "RSA" => match declared {
            None => Ok(Algorithm::RS256),
            Some(alg @ (Algorithm::RS256 | Algorithm::RS384 | Algorithm::RS512)) => Ok(alg),
            Some(other) => Err(unsupported(&format!("{other:?}"))),
        },
        "EC" => {
            let curve_alg = match jwk.crv.as_deref() {
                Some("P-256") => Algorithm::ES256,
                Some("P-384") => Algorithm::ES384,
                other => {
                    return Err(UnusableKey::UnsupportedKeyType(format!(
                        "EC/{}",
                        other.unwrap_or("none")
                    )))
                }
            };
            match declared {
                None => Ok(curve_alg),
                Some(alg) if alg == curve_alg => Ok(alg),
                Some(other) => Err(unsupported(&format!("{other:?}"))),
            }
        }
        other => Err(UnusableKey::UnsupportedKeyType(other.to_string())),
    }
}

fn build_decoding_key(jwk: &Jwk, algorithm: Algorithm) -> Result<DecodingKey, UnusableKey> {
    let missing = |field: &str| UnusableKey::InvalidMaterial(format!("missing '{field}'"));

    match algorithm {
        Algorithm::EdDSA => {
            let x = jwk.x.as_deref().ok_or_else(|| missing("x"))?;
            let public_key = decode_ed25519_public_key_jwk(x)
                .map_err(|e| UnusableKey::InvalidMaterial(e.to_string()))?;
            if public_key.len() != 32 {
                return Err(UnusableKey::InvalidMaterial(format!(
                    "Ed25519 key must be 32 bytes, got {}",
                    public_key.len()
                )));
            }
            Ok(DecodingKey::from_ed_der(&public_key))
        }
        Algorithm::RS256 | Algorithm::RS384 | Algorithm::RS512 => {
            let n = jwk.n.as_deref().ok_or_else(|| missing("n"))?;
            let e = jwk.e.as_deref().ok_or_else(|| missing("e"))?;
            DecodingKey::from_rsa_components(n, e)
                .map_err(|e| UnusableKey::InvalidMaterial(e.to_string()))
        }
        Algorithm::ES256 | Algorithm::ES384 => {
            let x = jwk.x.as_deref().ok_or_else(|| missing("x"))?;
            let y = jwk.y.as_deref().ok_or_else(|| missing("y"))?;
            DecodingKey::from_ec_components(x, y)
                .map_err(|e| UnusableKey::InvalidMaterial(e.to_string()))
        }
        other => Err(UnusableKey::UnsupportedAlgorithm {
            kty: jwk.kty.clone(),
            alg: format!("{other:?}"),
        }),
    }
}

/// Verification keys from one key-set response, in document order.
#[derive(Debug, Clone, Default)]
pub struct KeySet {
    keys: Vec<Arc<SigningKey>>,
}

impl KeySet {
    /// Normalize a JWKS document.
    ///
    /// Unusable keys are skipped with a WARN and duplicate key IDs keep
    /// their first occurrence.
    ///
    /// # Errors
    ///
    /// Returns `FetchError::InvalidResponse` if no usable key remains.
    pub fn from_jwks(response: JwksResponse) -> Result<Self, FetchError> {
        let published = response.keys.len();
        let mut seen = HashSet::new();
        let mut keys = Vec::with_capacity(published);

        for jwk in &response.keys {
            match SigningKey::from_jwk(jwk) {
                Ok(key) => {
                    if seen.insert(key.kid.clone()) {
                        keys.push(Arc::new(key));
                    } else {
                        tracing::warn!(target: "authn.jwks", kid = %key.kid, "Duplicate kid in key set, keeping first");
                    }
                }
                Err(reason) => {
                    tracing::warn!(
                        target: "authn.jwks",
                        kid = jwk.kid.as_deref().unwrap_or("<none>"),
                        kty = %jwk.kty,
                        reason = %reason,
                        "Skipping unusable key"
                    );
                }
            }
        }

        if keys.is_empty() {
            return Err(FetchError::InvalidResponse(format!(
                "no usable signing keys among {published} published"
            )));
        }

        Ok(Self { keys })
    }

    pub fn get(&self, kid: &str) -> Option<&Arc<SigningKey>> {
        self.keys.iter().find(|key| key.kid == kid)
    }

    pub fn keys(&self) -> impl Iterator<Item = &Arc<SigningKey>> {
        self.keys.iter()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Somewhere a [`KeySet`] can be fetched from.
///
/// Implementations perform exactly one attempt per call; retry and caching
/// belong to the key cache.
#[async_trait]
pub trait KeySource: Send + Sync {
    /// Human-readable location, for logs.
    fn endpoint(&self) -> &str;

    async fn fetch(&self) -> Result<KeySet, FetchError>;
}

/// Transport options for [`HttpKeySource`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpKeySourceOptions {
    pub timeout: Duration,

    /// Accept any server certificate. Development only.
    pub insecure_skip_tls_verify: bool,
}

impl Default for HttpKeySourceOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_FETCH_TIMEOUT,
            insecure_skip_tls_verify: false,
        }
    }
}

/// Fetches the key set with an HTTP GET.
pub struct HttpKeySource {
    url: String,
    http_client: reqwest::Client,
}

impl HttpKeySource {
    /// Create a key source for `url`.
    ///
    /// # Errors
    ///
    /// Returns `FetchError::Client` if the HTTP client cannot be built.
    pub fn new(url: impl Into<String>, options: HttpKeySourceOptions) -> Result<Self, FetchError> {
        let url = url.into();
        let mut builder = reqwest::Client::builder().timeout(options.timeout);

        if options.insecure_skip_tls_verify {
            tracing::warn!(
                target: "authn.jwks",
                url = %url,
                "TLS certificate verification is DISABLED for the signing-key endpoint"
            );
            builder = builder.danger_accept_invalid_certs(true);
        }

        let http_client = builder
            .build()
            .map_err(|e| FetchError::Client(e.to_string()))?;

        Ok(Self { url, http_client })
    }
}

#[async_trait]
impl KeySource for HttpKeySource {
    fn endpoint(&self) -> &str {
        &self.url
    }

    #[instrument(skip_all, fields(url = %self.url))]
    async fn fetch(&self) -> Result<KeySet, FetchError> {
        tracing::debug!(target: "authn.jwks", "Fetching signing keys");

        let response = self.http_client.get(&self.url).send().await.map_err(|e| {
            tracing::error!(target: "authn.jwks", error = %e, "Failed to fetch signing keys");
            if e.is_timeout() {
                FetchError::Timeout
            } else {
                FetchError::Transport(e.to_string())
            }
        })?;

        if !response.status().is_success() {
            tracing::error!(
                target: "authn.jwks",
                status = %response.status(),
                "Signing key endpoint returned error"
            );
            return Err(FetchError::Status(response.status().as_u16()));
        }

        let jwks: JwksResponse = response.json().await.map_err(|e| {
            tracing::error!(target: "authn.jwks", error = %e, "Failed to parse signing key set");
            if e.is_timeout() {
                FetchError::Timeout
            } else {
                FetchError::InvalidResponse(e.to_string())
            }
        })?;

        KeySet::from_jwks(jwks)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};

    fn ed25519_jwk(kid: &str) -> serde_json::Value {
        serde_json::json!({
            "kty": "OKP",
            "kid": kid,
            "crv": "Ed25519",
            "x": URL_SAFE_NO_PAD.encode([7u8; 32]),
            "alg": "EdDSA",
            "use": "sig"
        })
    }

    fn jwk(value: serde_json::Value) -> Jwk {
        serde_json::from_value(value).unwrap()
    }

    fn jwks(keys: Vec<serde_json::Value>) -> JwksResponse {
        serde_json::from_value(serde_json::json!({ "keys": keys })).unwrap()
    }

    #[test]
    fn test_jwk_deserialization() {
        let json = r#"{
            "kty": "OKP",
            "kid": "test-key-01",
            "crv": "Ed25519",
            "x": "dGVzdC1wdWJsaWMta2V5LWRhdGE",
            "alg": "EdDSA",
            "use": "sig",
            "exp": 1900000000
        }"#;

        let jwk: Jwk = serde_json::from_str(json).unwrap();

        assert_eq!(jwk.kty, "OKP");
        assert_eq!(jwk.kid.as_deref(), Some("test-key-01"));
        assert_eq!(jwk.crv.as_deref(), Some("Ed25519"));
        assert_eq!(jwk.alg.as_deref(), Some("EdDSA"));
        assert_eq!(jwk.key_use.as_deref(), Some("sig"));
        assert_eq!(jwk.exp, Some(1_900_000_000));
        assert!(jwk.nbf.is_none());
    }

    #[test]
    fn test_jwk_deserialization_minimal() {
        let jwk: Jwk = serde_json::from_str(r#"{"kty": "RSA"}"#).unwrap();

        assert_eq!(jwk.kty, "RSA");
        assert!(jwk.kid.is_none());
        assert!(jwk.n.is_none());
        assert!(jwk.key_use.is_none());
    }

    #[test]
    fn test_ed25519_key_is_admitted() {
        let key = SigningKey::from_jwk(&jwk(ed25519_jwk("k1"))).unwrap();

        assert_eq!(key.kid(), "k1");
        assert_eq!(key.algorithm(), Algorithm::EdDSA);
        assert!(key.is_valid_at(0));
    }

    #[test]
    fn test_okp_without_alg_defaults_to_eddsa() {
        let mut value = ed25519_jwk("k1");
        value.as_object_mut().unwrap().remove("alg");

        let key = SigningKey::from_jwk(&jwk(value)).unwrap();
        assert_eq!(key.algorithm(), Algorithm::EdDSA);
    }

    #[test]
    fn test_key_without_kid_is_rejected() {
        let mut value = ed25519_jwk("k1");
        value.as_object_mut().unwrap().remove("kid");

        assert_eq!(
            SigningKey::from_jwk(&jwk(value)).unwrap_err(),
            UnusableKey::MissingKid
        );
    }

    #[test]
    fn test_encryption_key_is_rejected() {
        let mut value = ed25519_jwk("k1");
        value["use"] = serde_json::json!("enc");

        assert!(matches!(
            SigningKey::from_jwk(&jwk(value)),
            Err(UnusableKey::NotForSigning(u)) if u == "enc"
        ));
    }

    #[test]
    fn test_okp_with_rsa_algorithm_is_rejected() {
        let mut value = ed25519_jwk("k1");
        value["alg"] = serde_json::json!("RS256");

        assert!(matches!(
            SigningKey::from_jwk(&jwk(value)),
            Err(UnusableKey::UnsupportedAlgorithm { .. })
        ));
    }

    #[test]
    fn test_unknown_algorithm_is_rejected() {
        let mut value = ed25519_jwk("k1");
        value["alg"] = serde_json::json!("none");

        assert!(matches!(
            SigningKey::from_jwk(&jwk(value)),
            Err(UnusableKey::UnsupportedAlgorithm { .. })
        ));
    }

    #[test]
    fn test_x25519_curve_is_rejected() {
        let mut value = ed25519_jwk("k1");
        value["crv"] = serde_json::json!("X25519");

        assert!(matches!(
            SigningKey::from_jwk(&jwk(value)),
            Err(UnusableKey::UnsupportedKeyType(_))
        ));
    }

    #[test]
    fn test_short_ed25519_key_is_rejected() {
        let mut value = ed25519_jwk("k1");
        value["x"] = serde_json::json!(URL_SAFE_NO_PAD.encode([1u8; 16]));

        assert!(matches!(
            SigningKey::from_jwk(&jwk(value)),
            Err(UnusableKey::InvalidMaterial(_))
        ));
    }

    #[test]
    fn test_invalid_base64_key_is_rejected() {
        let mut value = ed25519_jwk("k1");
        value["x"] = serde_json::json!("!!!invalid-base64!!!");

        assert!(matches!(
            SigningKey::from_jwk(&jwk(value)),
            Err(UnusableKey::InvalidMaterial(_))
        ));
    }

    #[test]
    fn test_rsa_key_defaults_to_rs256() {
        let key = SigningKey::from_jwk(&jwk(serde_json::json!({
            "kty": "RSA",
            "kid": "rsa-1",
            "n": URL_SAFE_NO_PAD.encode([0xc3u8; 256]),
            "e": "AQAB"
        })))
        .unwrap();

        assert_eq!(key.algorithm(), Algorithm::RS256);
    }

    #[test]
    fn test_rsa_key_without_modulus_is_rejected() {
        let result = SigningKey::from_jwk(&jwk(serde_json::json!({
            "kty": "RSA",
            "kid": "rsa-1",
            "alg": "RS512",
            "e": "AQAB"
        })));

        assert!(matches!(result, Err(UnusableKey::InvalidMaterial(_))));
    }

    #[test]
    fn test_ec_algorithm_follows_curve() {
        let coordinate = URL_SAFE_NO_PAD.encode([2u8; 48]);
        let p384 = SigningKey::from_jwk(&jwk(serde_json::json!({
            "kty": "EC",
            "kid": "ec-1",
            "crv": "P-384",
            "x": coordinate,
            "y": coordinate
        })))
        .unwrap();
        assert_eq!(p384.algorithm(), Algorithm::ES384);

        let mismatched = SigningKey::from_jwk(&jwk(serde_json::json!({
            "kty": "EC",
            "kid": "ec-2",
            "crv": "P-256",
            "alg": "ES384",
            "x": coordinate,
            "y": coordinate
        })));
        assert!(matches!(
            mismatched,
            Err(UnusableKey::UnsupportedAlgorithm { .. })
        ));
    }

    #[test]
    fn test_unsupported_key_type_is_rejected() {
        let result = SigningKey::from_jwk(&jwk(serde_json::json!({
            "kty": "oct",
            "kid": "hmac-1",
            "k": "c2VjcmV0"
        })));

        assert_eq!(
            result.unwrap_err(),
            UnusableKey::UnsupportedKeyType("oct".to_string())
        );
    }

    #[test]
    fn test_validity_window() {
        let mut value = ed25519_jwk("k1");
        value["nbf"] = serde_json::json!(1000);
        value["exp"] = serde_json::json!(2000);
        let key = SigningKey::from_jwk(&jwk(value)).unwrap();

        assert!(!key.is_valid_at(999));
        assert!(key.is_valid_at(1000));
        assert!(key.is_valid_at(1999));
        assert!(!key.is_valid_at(2000));
    }

    #[test]
    fn test_signing_key_debug_omits_material() {
        let key = SigningKey::from_jwk(&jwk(ed25519_jwk("k1"))).unwrap();
        let debug_str = format!("{:?}", key);

        assert!(debug_str.contains("k1"));
        assert!(!debug_str.contains("decoding_key"));
    }

    #[test]
    fn test_key_set_skips_unusable_keys() {
        let set = KeySet::from_jwks(jwks(vec![
            serde_json::json!({"kty": "OKP"}),
            ed25519_jwk("k1"),
            serde_json::json!({"kty": "oct", "kid": "hmac"}),
            ed25519_jwk("k2"),
        ]))
        .unwrap();

        assert_eq!(set.len(), 2);
        assert!(set.get("k1").is_some());
        assert!(set.get("k2").is_some());
        assert!(set.get("hmac").is_none());
    }

    #[test]
    fn test_key_set_keeps_first_duplicate() {
        let mut second = ed25519_jwk("k1");
        second["x"] = serde_json::json!(URL_SAFE_NO_PAD.encode([9u8; 32]));
        second["exp"] = serde_json::json!(5);

        let set = KeySet::from_jwks(jwks(vec![ed25519_jwk("k1"), second])).unwrap();

        assert_eq!(set.len(), 1);
        // The first occurrence has no expiry; the duplicate would be invalid at t=10.
        assert!(set.get("k1").unwrap().is_valid_at(10));
    }

    #[test]
    fn test_key_set_preserves_document_order() {
        let set = KeySet::from_jwks(jwks(vec![
            ed25519_jwk("b"),
            ed25519_jwk("a"),
            ed25519_jwk("c"),
        ]))
        .unwrap();

        let kids: Vec<&str> = set.keys().map(|key| key.kid()).collect();
        assert_eq!(kids, vec!["b", "a", "c"]);
    }

    #[test]
    fn test_key_set_without_usable_keys_is_an_error() {
        let result = KeySet::from_jwks(jwks(vec![serde_json::json!({"kty": "OKP"})]));
        assert!(matches!(result, Err(FetchError::InvalidResponse(_))));

        let empty = KeySet::from_jwks(jwks(vec![]));
        assert!(matches!(empty, Err(FetchError::InvalidResponse(_))));
    }

    #[test]
    fn test_http_source_creation() {
        let source = HttpKeySource::new(
            "http://localhost:8082/.well-known/jwks.json",
            HttpKeySourceOptions::default(),
        )
        .unwrap();

        assert_eq!(
            source.endpoint(),
            "http://localhost:8082/.well-known/jwks.json"
        );
    }

    #[test]
    fn test_default_options() {
        let options = HttpKeySourceOptions::default();
        assert_eq!(options.timeout, Duration::from_secs(10));
        assert!(!options.insecure_skip_tls_verify);
    }
}
