//! JWT utilities shared across the authn crates.
//!
//! This module provides the token-format plumbing that sits underneath
//! signature verification:
//! - Size limits for DoS prevention
//! - Clock skew constants for iat/nbf validation
//! - Unverified decoding of the JOSE header and claims segment
//! - iat/nbf validation logic
//! - JWK public key decoding helpers
//!
//! # Security
//!
//! - Tokens are size-checked BEFORE parsing (DoS prevention)
//! - Nothing decoded here is trusted until the signature has been verified,
//!   or the caller has explicitly opted out of verification
//! - Generic error messages prevent information leakage
//!
//! # Usage
//!
//! ```rust,ignore
//! use common::jwt::{decode_unverified, validate_iat_at, DEFAULT_CLOCK_SKEW};
//!
//! let token = decode_unverified::<MyClaims>(raw)?;
//! let kid = token.header.kid()?;
//!
//! // After signature verification, validate iat
//! validate_iat_at(token.claims.iat, DEFAULT_CLOCK_SKEW, now)?;
//! ```

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

// =============================================================================
// Constants
// =============================================================================

/// Maximum allowed JWT size in bytes (8KB).
///
/// JWTs larger than this size are rejected BEFORE any base64 decoding or
/// cryptographic operation.
///
/// # Rationale
///
/// - Identity tokens with a handful of claims are 400-900 bytes
/// - Access tokens carrying scope lists stay well under 4KB
/// - Checked before decode so an oversized token costs a length comparison
pub const MAX_JWT_SIZE_BYTES: usize = 8192; // 8KB

/// Default JWT clock skew tolerance (5 minutes).
///
/// Tokens with `iat` or `nbf` more than this amount in the future are
/// rejected.
pub const DEFAULT_CLOCK_SKEW: Duration = Duration::from_secs(300);

/// Maximum allowed JWT clock skew tolerance (10 minutes).
///
/// Upper bound for configuration validation.
pub const MAX_CLOCK_SKEW: Duration = Duration::from_secs(600);

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur while decoding or time-checking a JWT.
///
/// Note: Error messages are intentionally generic to prevent information leakage.
/// Detailed information is logged at debug level for troubleshooting.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JwtValidationError {
    /// Token size exceeds maximum allowed.
    #[error("The token is invalid or expired")]
    TokenTooLarge,

    /// Token format is invalid (not a valid JWT structure).
    #[error("The token is invalid or expired")]
    MalformedToken,

    /// Token is missing required `kid` header.
    #[error("The token is invalid or expired")]
    MissingKid,

    /// Token `iat` claim is too far in the future.
    #[error("The token is invalid or expired")]
    IatTooFarInFuture,

    /// Token `nbf` claim has not been reached yet.
    #[error("The token is invalid or expired")]
    NotYetValid,
}

// =============================================================================
// Token Types
// =============================================================================

/// JOSE header fields used for key selection.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct JwtHeader {
    /// Signing algorithm declared by the issuer (e.g. "EdDSA", "RS256").
    pub alg: String,

    /// Key ID used to select the verification key.
    #[serde(default)]
    pub kid: Option<String>,

    /// Media type of the token ("JWT", "at+jwt").
    #[serde(default)]
    pub typ: Option<String>,
}

impl JwtHeader {
    /// Returns the key ID, rejecting absent or empty values.
    ///
    /// # Errors
    ///
    /// Returns `JwtValidationError::MissingKid` if the header has no usable `kid`.
    pub fn kid(&self) -> Result<&str, JwtValidationError> {
        self.kid
            .as_deref()
            .filter(|kid| !kid.is_empty())
            .ok_or(JwtValidationError::MissingKid)
    }
}

/// A structurally decoded token whose signature has NOT been checked.
#[derive(Debug, Clone)]
pub struct UnverifiedToken<C> {
    /// Decoded JOSE header.
    pub header: JwtHeader,

    /// Decoded claims segment.
    pub claims: C,
}

// =============================================================================
// Functions
// =============================================================================

/// Split a compact JWT into its three segments.
///
/// Header and payload must be non-empty. The signature segment may be empty;
/// whether that is acceptable is decided by signature verification.
fn split_token(token: &str) -> Result<(&str, &str, &str), JwtValidationError> {
    if token.len() > MAX_JWT_SIZE_BYTES {
        tracing::debug!(
            target: "common.jwt",
            token_size = token.len(),
            max_size = MAX_JWT_SIZE_BYTES,
            "Token rejected: size exceeds maximum allowed"
        );
        return Err(JwtValidationError::TokenTooLarge);
    }

    let mut parts = token.split('.');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(header), Some(payload), Some(signature), None)
            if !header.is_empty() && !payload.is_empty() =>
        {
            Ok((header, payload, signature))
        }
        _ => {
            tracing::debug!(
                target: "common.jwt",
                parts = token.split('.').count(),
                "Token rejected: invalid JWT format"
            );
            Err(JwtValidationError::MalformedToken)
        }
    }
}

/// Base64url-decode a segment and parse it as JSON.
fn decode_segment<T: DeserializeOwned>(segment: &str) -> Result<T, JwtValidationError> {
    let bytes = URL_SAFE_NO_PAD.decode(segment).map_err(|e| {
        tracing::debug!(target: "common.jwt", error = %e, "Failed to decode JWT segment base64");
        JwtValidationError::MalformedToken
    })?;

    serde_json::from_slice(&bytes).map_err(|e| {
        tracing::debug!(target: "common.jwt", error = %e, "Failed to parse JWT segment JSON");
        JwtValidationError::MalformedToken
    })
}

/// Decode the JOSE header of a JWT without touching the claims or signature.
///
/// # Errors
///
/// - `TokenTooLarge` - Token exceeds `MAX_JWT_SIZE_BYTES`
/// - `MalformedToken` - Wrong structure, bad base64 or invalid JSON
pub fn decode_header(token: &str) -> Result<JwtHeader, JwtValidationError> {
    let (header, _, _) = split_token(token)?;
    decode_segment(header)
}

/// Decode header and claims of a JWT without verifying the signature.
///
/// Used as the structural first step of verification, and as the only step
/// for in-process callers whose tokens never cross a network edge.
///
/// # Errors
///
/// - `TokenTooLarge` - Token exceeds size limit
/// - `MalformedToken` - Token format invalid, or claims do not match `C`
pub fn decode_unverified<C: DeserializeOwned>(
    token: &str,
) -> Result<UnverifiedToken<C>, JwtValidationError> {
    let (header, payload, _) = split_token(token)?;
    Ok(UnverifiedToken {
        header: decode_segment(header)?,
        claims: decode_segment(payload)?,
    })
}

/// Validate the `iat` (issued-at) claim against `now` with clock skew tolerance.
///
/// Rejects tokens with `iat` too far in the future, which could indicate
/// token pre-generation or clock synchronization issues.
///
/// # Errors
///
/// Returns `JwtValidationError::IatTooFarInFuture` if the iat timestamp is more than
/// `clock_skew` past `now`.
pub fn validate_iat_at(iat: i64, clock_skew: Duration, now: i64) -> Result<(), JwtValidationError> {
    let max_iat = now.saturating_add(skew_secs(clock_skew));

    if iat > max_iat {
        tracing::debug!(
            target: "common.jwt",
            iat = iat,
            now = now,
            max_allowed = max_iat,
            "Token rejected: iat too far in the future"
        );
        return Err(JwtValidationError::IatTooFarInFuture);
    }

    Ok(())
}

/// Validate the `nbf` (not-before) claim with clock skew tolerance.
///
/// # Errors
///
/// Returns `JwtValidationError::NotYetValid` if `nbf` is more than `clock_skew`
/// in the future.
pub fn validate_nbf_at(nbf: i64, clock_skew: Duration, now: i64) -> Result<(), JwtValidationError> {
    if nbf > now.saturating_add(skew_secs(clock_skew)) {
        tracing::debug!(
            target: "common.jwt",
            nbf = nbf,
            now = now,
            "Token rejected: not valid yet"
        );
        return Err(JwtValidationError::NotYetValid);
    }

    Ok(())
}

fn skew_secs(clock_skew: Duration) -> i64 {
    i64::try_from(clock_skew.as_secs()).unwrap_or(i64::MAX)
}

/// Decode an Ed25519 public key from JWK `x` field (base64url format).
///
/// The `x` field in an OKP (Octet Key Pair) JWK contains the raw 32-byte
/// public key in base64url encoding without padding.
///
/// # Errors
///
/// Returns `base64::DecodeError` if the base64url content cannot be decoded.
pub fn decode_ed25519_public_key_jwk(x_b64url: &str) -> Result<Vec<u8>, base64::DecodeError> {
    URL_SAFE_NO_PAD.decode(x_b64url)
}

// =============================================================================
// Tests
// =============================================================================
