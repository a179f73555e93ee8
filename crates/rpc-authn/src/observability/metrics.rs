//! Metrics for signing-key retrieval and token verification.
//!
//! All metrics follow Prometheus naming conventions:
//! - `authn_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded to prevent cardinality explosion:
//! - `status`: success or a `FetchError` kind (6 values)
//! - `result`: hit, miss (2 values)
//! - `token_type`: identity, access (2 values)
//! - `outcome`: accepted or an `AuthRejection` reason (9 values)
//! - `reason`: manual, bad_signature (2 values)
//!
//! Key IDs, subjects and tenants are never used as labels.

use crate::auth::claims::TokenType;
use metrics::{counter, histogram};
use std::time::Duration;

/// Record one key-set fetch attempt.
///
/// Metric: `authn_key_fetch_total`, `authn_key_fetch_duration_seconds`
/// Labels: `status`
pub fn record_key_fetch(status: &'static str, duration: Duration) {
    histogram!("authn_key_fetch_duration_seconds", "status" => status)
        .record(duration.as_secs_f64());
    counter!("authn_key_fetch_total", "status" => status).increment(1);
}

/// Record a key cache lookup.
///
/// Metric: `authn_key_cache_lookups_total`
/// Labels: `result` (hit, miss)
pub fn record_key_cache_lookup(result: &'static str) {
    counter!("authn_key_cache_lookups_total", "result" => result).increment(1);
}

/// Record the outcome of verifying one token.
///
/// Metric: `authn_verifications_total`
/// Labels: `token_type`, `outcome`
pub fn record_verification(token_type: TokenType, outcome: &'static str) {
    counter!("authn_verifications_total",
        "token_type" => token_type.as_str(),
        "outcome" => outcome
    )
    .increment(1);
}

/// Record the active key set being dropped before its TTL.
///
/// Metric: `authn_key_cache_invalidations_total`
/// Labels: `reason`
pub fn record_cache_invalidation(reason: &'static str) {
    counter!("authn_key_cache_invalidations_total", "reason" => reason).increment(1);
}
