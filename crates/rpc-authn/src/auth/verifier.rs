//! Token verification.
//!
//! Verifies identity and access tokens against an [`AuthPolicy`] using keys
//! from the shared [`KeyCache`].
//!
//! # Security
//!
//! - Tokens are size-checked BEFORE parsing (DoS prevention)
//! - Expiry is checked before any key lookup, so expired tokens never cause
//!   a fetch
//! - The header `alg` must match the algorithm of the resolved key
//! - Rejections carry no token contents; details are logged at debug level

use crate::auth::claims::{CallerIdentity, TokenClaims, TokenType};
use crate::auth::jwks::SigningKey;
use crate::auth::key_cache::{KeyCache, KeyLookupError};
use crate::errors::{AuthRejection, UnknownKeyCause};
use crate::observability::metrics;
use crate::policy::AuthPolicy;
use common::jwt::{decode_unverified, validate_iat_at, validate_nbf_at, JwtHeader};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, Algorithm, Validation};
use std::str::FromStr;
use std::sync::Arc;
use tracing::instrument;

/// Verifies tokens; holds the key cache when signatures are checked.
#[derive(Clone)]
pub struct TokenVerifier {
    key_cache: Option<Arc<KeyCache>>,
}

impl TokenVerifier {
    /// Create a verifier. `key_cache` may be `None` only for policies that
    /// skip signature verification.
    pub fn new(key_cache: Option<Arc<KeyCache>>) -> Self {
        Self { key_cache }
    }

    pub fn key_cache(&self) -> Option<&Arc<KeyCache>> {
        self.key_cache.as_ref()
    }

    /// Verify one token and derive the caller identity it asserts.
    ///
    /// # Checks (in order, each an early exit)
    ///
    /// 1. Size and structure of header and claims, and header `typ`
    /// 2. `exp` (no leeway), then `nbf` and `iat` with the policy clock skew
    /// 3. Audience against the policy allow-list
    /// 4. Issuer against the policy allow-list, if one is configured
    /// 5. Key lookup by header `kid`
    /// 6. Signature with the resolved key
    ///
    /// Steps 5 and 6 are skipped when the policy does not verify signatures.
    ///
    /// # Errors
    ///
    /// Returns the [`AuthRejection`] for the first failing check.
    #[instrument(skip_all, fields(token_type = %token_type))]
    pub async fn verify(
        &self,
        token: &str,
        policy: &AuthPolicy,
        token_type: TokenType,
    ) -> Result<CallerIdentity, AuthRejection> {
        let result = self.verify_claims(token, policy, token_type).await;

        match &result {
            Ok(_) => {
                metrics::record_verification(token_type, "accepted");
                tracing::debug!(target: "authn.verifier", "Token verified");
            }
            Err(rejection) => {
                metrics::record_verification(token_type, rejection.reason());
                tracing::debug!(
                    target: "authn.verifier",
                    reason = rejection.reason(),
                    "Token rejected"
                );
            }
        }

        result.map(|claims| CallerIdentity::from_claims(claims, token_type))
    }

    async fn verify_claims(
        &self,
        token: &str,
        policy: &AuthPolicy,
        token_type: TokenType,
    ) -> Result<TokenClaims, AuthRejection> {
        let now = chrono::Utc::now().timestamp();

        // 1. Structure
        let decoded = decode_unverified::<TokenClaims>(token).map_err(|e| {
            tracing::debug!(target: "authn.verifier", error = ?e, "Token decoding failed");
            AuthRejection::BadSignature(token_type)
        })?;
        check_typ(&decoded.header, token_type)?;
        let claims = decoded.claims;

        // 2. Time
        check_time(&claims, policy, now, token_type)?;

        // 3. Audience
        if !claims.audiences().any(|aud| policy.allows_audience(aud)) {
            tracing::debug!(
                target: "authn.verifier",
                audiences = ?claims.audiences().collect::<Vec<_>>(),
                "Token audience not allowed"
            );
            return Err(AuthRejection::AudienceMismatch(token_type));
        }

        // 4. Issuer
        if !policy.allows_issuer(claims.iss.as_deref()) {
            tracing::debug!(target: "authn.verifier", iss = ?claims.iss, "Token issuer not allowed");
            return Err(AuthRejection::InvalidIssuer(token_type));
        }

        if !policy.verifies_signatures() {
            tracing::trace!(target: "authn.verifier", "Signature verification skipped by policy");
            return Ok(claims);
        }

        // 5. Key lookup
        let Some(key_cache) = self.key_cache.as_ref() else {
            tracing::error!(target: "authn.verifier", "Signature verification required but no key cache configured");
            return Err(AuthRejection::UnknownKey {
                token: token_type,
                cause: UnknownKeyCause::FetchFailed,
            });
        };

        let kid = decoded.header.kid().map_err(|_| {
            tracing::debug!(target: "authn.verifier", "Token has no kid");
            AuthRejection::UnknownKey {
                token: token_type,
                cause: UnknownKeyCause::NotFound,
            }
        })?;

        let key = key_cache.get(kid).await.map_err(|e| {
            let cause = match &e {
                KeyLookupError::NotFound => UnknownKeyCause::NotFound,
                KeyLookupError::Fetch(fetch_error) => {
                    tracing::warn!(
                        target: "authn.verifier",
                        kid = %kid,
                        error = %fetch_error,
                        "Signing keys unavailable"
                    );
                    UnknownKeyCause::FetchFailed
                }
            };
            AuthRejection::UnknownKey {
                token: token_type,
                cause,
            }
        })?;

        // 6. Signature
        if let Err(e) = verify_signature(token, &decoded.header, &key) {
            tracing::debug!(target: "authn.verifier", kid = %kid, error = %e, "Token signature invalid");
            key_cache
                .report_bad_signature(kid, policy.bad_signature_policy())
                .await;
            return Err(AuthRejection::BadSignature(token_type));
        }

        Ok(claims)
    }
}

/// Accept only the media types issuers use for each token.
fn check_typ(header: &JwtHeader, token_type: TokenType) -> Result<(), AuthRejection> {
    let Some(typ) = header.typ.as_deref() else {
        return Ok(());
    };

    let accepted = typ.eq_ignore_ascii_case("JWT")
        || (token_type == TokenType::Access && typ.eq_ignore_ascii_case("at+jwt"));

    if accepted {
        Ok(())
    } else {
        tracing::debug!(target: "authn.verifier", typ = %typ, "Unexpected token typ");
        Err(AuthRejection::BadSignature(token_type))
    }
}

fn check_time(
    claims: &TokenClaims,
    policy: &AuthPolicy,
    now: i64,
    token_type: TokenType,
) -> Result<(), AuthRejection> {
    if claims.exp <= now {
        tracing::debug!(target: "authn.verifier", exp = claims.exp, now, "Token expired");
        return Err(AuthRejection::ExpiredToken(token_type));
    }

    if let Some(nbf) = claims.nbf {
        validate_nbf_at(nbf, policy.clock_skew(), now)
            .map_err(|_| AuthRejection::ExpiredToken(token_type))?;
    }

    if let Some(iat) = claims.iat {
        validate_iat_at(iat, policy.clock_skew(), now)
            .map_err(|_| AuthRejection::ExpiredToken(token_type))?;
    }

    Ok(())
}

/// Check the token signature with `key`.
///
/// Only the signature and algorithm are checked here; claims were
/// validated before the key was looked up.
fn verify_signature(
    token: &str,
    header: &JwtHeader,
    key: &SigningKey,
) -> Result<(), jsonwebtoken::errors::Error> {
    let declared = Algorithm::from_str(&header.alg)?;
    if declared != key.algorithm() {
        return Err(ErrorKind::InvalidAlgorithm.into());
    }

    let mut validation = Validation::new(key.algorithm());
    validation.validate_exp = false;
    validation.validate_nbf = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();

    decode::<serde_json::Value>(token, key.decoding_key(), &validation).map(|_| ())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::policy::DeploymentMode;
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};

    fn unsigned_token(header: &str, claims: serde_json::Value) -> String {
        format!(
            "{}.{}.",
            URL_SAFE_NO_PAD.encode(header.as_bytes()),
            URL_SAFE_NO_PAD.encode(claims.to_string().as_bytes())
        )
    }

    fn claims(exp_offset: i64) -> serde_json::Value {
        let now = chrono::Utc::now().timestamp();
        serde_json::json!({
            "sub": "user:1",
            "aud": "orders-api",
            "exp": now + exp_offset,
            "iat": now,
            "tenant": "stacks-1",
            "scope": "read"
        })
    }

    fn in_process_policy() -> AuthPolicy {
        AuthPolicy::builder(DeploymentMode::InProcess)
            .allowed_audiences(["orders-api"])
            .skip_signature_verification(true)
            .build()
            .unwrap()
    }

    const HEADER: &str = r#"{"alg":"EdDSA","typ":"JWT","kid":"k1"}"#;

    #[tokio::test]
    async fn test_unverified_policy_trusts_structurally_valid_token() {
        let verifier = TokenVerifier::new(None);
        let token = unsigned_token(HEADER, claims(3600));

        let identity = verifier
            .verify(&token, &in_process_policy(), TokenType::Identity)
            .await
            .unwrap();

        assert_eq!(identity.subject, "user:1");
        assert_eq!(identity.tenant.as_deref(), Some("stacks-1"));
        assert_eq!(identity.scopes, vec!["read"]);
    }

    #[tokio::test]
    async fn test_expired_token_is_rejected() {
        let verifier = TokenVerifier::new(None);
        let token = unsigned_token(HEADER, claims(-1));

        assert_eq!(
            verifier
                .verify(&token, &in_process_policy(), TokenType::Identity)
                .await,
            Err(AuthRejection::ExpiredToken(TokenType::Identity))
        );
    }

    #[tokio::test]
    async fn test_exp_equal_to_now_is_expired() {
        let verifier = TokenVerifier::new(None);
        let token = unsigned_token(HEADER, claims(0));

        assert_eq!(
            verifier
                .verify(&token, &in_process_policy(), TokenType::Identity)
                .await,
            Err(AuthRejection::ExpiredToken(TokenType::Identity))
        );
    }

    #[tokio::test]
    async fn test_not_yet_valid_token_is_rejected_as_expired() {
        let verifier = TokenVerifier::new(None);
        let mut value = claims(7200);
        value["nbf"] = serde_json::json!(chrono::Utc::now().timestamp() + 3600);
        let token = unsigned_token(HEADER, value);

        assert_eq!(
            verifier
                .verify(&token, &in_process_policy(), TokenType::Identity)
                .await,
            Err(AuthRejection::ExpiredToken(TokenType::Identity))
        );
    }

    #[tokio::test]
    async fn test_nbf_within_skew_is_accepted() {
        let verifier = TokenVerifier::new(None);
        let mut value = claims(7200);
        value["nbf"] = serde_json::json!(chrono::Utc::now().timestamp() + 60);
        let token = unsigned_token(HEADER, value);

        assert!(verifier
            .verify(&token, &in_process_policy(), TokenType::Identity)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_future_iat_is_rejected() {
        let verifier = TokenVerifier::new(None);
        let mut value = claims(7200);
        value["iat"] = serde_json::json!(chrono::Utc::now().timestamp() + 3600);
        let token = unsigned_token(HEADER, value);

        assert_eq!(
            verifier
                .verify(&token, &in_process_policy(), TokenType::Access)
                .await,
            Err(AuthRejection::ExpiredToken(TokenType::Access))
        );
    }

    #[tokio::test]
    async fn test_audience_mismatch() {
        let verifier = TokenVerifier::new(None);
        let mut value = claims(3600);
        value["aud"] = serde_json::json!(["billing-api", "search-api"]);
        let token = unsigned_token(HEADER, value);

        assert_eq!(
            verifier
                .verify(&token, &in_process_policy(), TokenType::Identity)
                .await,
            Err(AuthRejection::AudienceMismatch(TokenType::Identity))
        );
    }

    #[tokio::test]
    async fn test_missing_audience_is_a_mismatch() {
        let verifier = TokenVerifier::new(None);
        let mut value = claims(3600);
        value.as_object_mut().unwrap().remove("aud");
        let token = unsigned_token(HEADER, value);

        assert_eq!(
            verifier
                .verify(&token, &in_process_policy(), TokenType::Identity)
                .await,
            Err(AuthRejection::AudienceMismatch(TokenType::Identity))
        );
    }

    #[tokio::test]
    async fn test_any_matching_audience_is_enough() {
        let verifier = TokenVerifier::new(None);
        let mut value = claims(3600);
        value["aud"] = serde_json::json!(["billing-api", "orders-api"]);
        let token = unsigned_token(HEADER, value);

        assert!(verifier
            .verify(&token, &in_process_policy(), TokenType::Identity)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_issuer_allow_list() {
        let verifier = TokenVerifier::new(None);
        let policy = AuthPolicy::builder(DeploymentMode::InProcess)
            .allowed_audiences(["orders-api"])
            .allowed_issuers(["https://issuer.example.com"])
            .skip_signature_verification(true)
            .build()
            .unwrap();

        let mut value = claims(3600);
        value["iss"] = serde_json::json!("https://other.example.com");
        let token = unsigned_token(HEADER, value.clone());
        assert_eq!(
            verifier.verify(&token, &policy, TokenType::Identity).await,
            Err(AuthRejection::InvalidIssuer(TokenType::Identity))
        );

        value["iss"] = serde_json::json!("https://issuer.example.com");
        let token = unsigned_token(HEADER, value);
        assert!(verifier
            .verify(&token, &policy, TokenType::Identity)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_malformed_tokens_are_bad_signature() {
        let verifier = TokenVerifier::new(None);
        let policy = in_process_policy();

        for token in ["", "not-a-jwt", "a.b", "!!!.???.sig"] {
            assert_eq!(
                verifier.verify(token, &policy, TokenType::Identity).await,
                Err(AuthRejection::BadSignature(TokenType::Identity)),
                "token {token:?} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn test_oversized_token_is_rejected() {
        let verifier = TokenVerifier::new(None);
        let mut value = claims(3600);
        value["padding"] = serde_json::json!("x".repeat(9000));
        let token = unsigned_token(HEADER, value);

        assert_eq!(
            verifier
                .verify(&token, &in_process_policy(), TokenType::Identity)
                .await,
            Err(AuthRejection::BadSignature(TokenType::Identity))
        );
    }

    #[tokio::test]
    async fn test_typ_is_checked_per_token_type() {
        let verifier = TokenVerifier::new(None);
        let policy = in_process_policy();
        let at_header = r#"{"alg":"EdDSA","typ":"at+jwt","kid":"k1"}"#;
        let token = unsigned_token(at_header, claims(3600));

        assert!(verifier
            .verify(&token, &policy, TokenType::Access)
            .await
            .is_ok());
        assert_eq!(
            verifier.verify(&token, &policy, TokenType::Identity).await,
            Err(AuthRejection::BadSignature(TokenType::Identity))
        );

        let no_typ = unsigned_token(r#"{"alg":"EdDSA","kid":"k1"}"#, claims(3600));
        assert!(verifier
            .verify(&no_typ, &policy, TokenType::Identity)
            .await
            .is_ok());
    }

    #[test]
    fn test_check_typ_is_case_insensitive() {
        let header = JwtHeader {
            alg: "EdDSA".to_string(),
            kid: None,
            typ: Some("jwt".to_string()),
        };
        assert!(check_typ(&header, TokenType::Identity).is_ok());
    }
}
