//! Error types for call authentication and signing-key retrieval.
//!
//! [`AuthRejection`] is what callers of the authenticator see. Its Display
//! output and gRPC status never include token contents, key material, or
//! the reason a key lookup failed; those are logged server-side.

use crate::auth::claims::TokenType;
use thiserror::Error;
use tonic::{Code, Status};

/// Why a key lookup came back empty. Kept for logs and metrics only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnknownKeyCause {
    /// The key set was available but holds no usable key with this `kid`.
    NotFound,
    /// The key set could not be retrieved.
    FetchFailed,
}

/// Reason an RPC call was not authenticated.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthRejection {
    #[error("Missing {0} token")]
    MissingToken(TokenType),

    /// Expired, or not yet valid beyond the allowed clock skew.
    #[error("The {0} token is invalid or expired")]
    ExpiredToken(TokenType),

    /// Malformed token, disallowed algorithm, or failed signature check.
    #[error("The {0} token is invalid or expired")]
    BadSignature(TokenType),

    /// No usable verification key for the token's `kid`.
    #[error("The {token} token is invalid or expired")]
    UnknownKey {
        token: TokenType,
        cause: UnknownKeyCause,
    },

    #[error("The {0} token audience is not accepted")]
    AudienceMismatch(TokenType),

    #[error("The {0} token issuer is not accepted")]
    InvalidIssuer(TokenType),

    #[error("Identity and access tokens belong to different tenants")]
    TenantMismatch,
}

impl AuthRejection {
    /// Bounded label for metrics and structured logs.
    pub fn reason(&self) -> &'static str {
        match self {
            AuthRejection::MissingToken(_) => "missing_token",
            AuthRejection::ExpiredToken(_) => "expired_token",
            AuthRejection::BadSignature(_) => "bad_signature",
            AuthRejection::UnknownKey {
                cause: UnknownKeyCause::NotFound,
                ..
            } => "unknown_key",
            AuthRejection::UnknownKey {
                cause: UnknownKeyCause::FetchFailed,
                ..
            } => "key_fetch_failure",
            AuthRejection::AudienceMismatch(_) => "audience_mismatch",
            AuthRejection::InvalidIssuer(_) => "invalid_issuer",
            AuthRejection::TenantMismatch => "tenant_mismatch",
        }
    }

    /// The gRPC status code a rejection maps to.
    ///
    /// Credentials that are valid but meant for someone else are
    /// PERMISSION_DENIED; everything else is UNAUTHENTICATED.
    pub fn code(&self) -> Code {
        match self {
            AuthRejection::AudienceMismatch(_) | AuthRejection::TenantMismatch => {
                Code::PermissionDenied
            }
            _ => Code::Unauthenticated,
        }
    }

    /// Convert to a gRPC status carrying only a coarse message.
    pub fn to_status(&self) -> Status {
        match self.code() {
            Code::PermissionDenied => Status::permission_denied("Access denied"),
            _ => Status::unauthenticated("Authentication required"),
        }
    }
}

impl From<AuthRejection> for Status {
    fn from(rejection: AuthRejection) -> Self {
        rejection.to_status()
    }
}

/// Failure to retrieve or parse a signing key set.
///
/// Cloneable so one result can be shared by every caller waiting on the
/// same refresh.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("Signing key request timed out")]
    Timeout,

    #[error("Signing key request failed: {0}")]
    Transport(String),

    #[error("Signing key endpoint returned status {0}")]
    Status(u16),

    #[error("Invalid signing key set: {0}")]
    InvalidResponse(String),

    #[error("Failed to build signing key client: {0}")]
    Client(String),
}

impl FetchError {
    /// Bounded label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::Timeout => "timeout",
            FetchError::Transport(_) => "transport",
            FetchError::Status(_) => "status",
            FetchError::InvalidResponse(_) => "invalid_response",
            FetchError::Client(_) => "client",
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_key_display_hides_cause() {
        let not_found = AuthRejection::UnknownKey {
            token: TokenType::Identity,
            cause: UnknownKeyCause::NotFound,
        };
        let fetch_failed = AuthRejection::UnknownKey {
            token: TokenType::Identity,
            cause: UnknownKeyCause::FetchFailed,
        };

        assert_eq!(not_found.to_string(), fetch_failed.to_string());
        assert_eq!(
            not_found.to_status().message(),
            fetch_failed.to_status().message()
        );
        assert_ne!(not_found.reason(), fetch_failed.reason());
    }

    #[test]
    fn test_status_codes() {
        let unauthenticated = [
            AuthRejection::MissingToken(TokenType::Identity),
            AuthRejection::ExpiredToken(TokenType::Access),
            AuthRejection::BadSignature(TokenType::Identity),
            AuthRejection::UnknownKey {
                token: TokenType::Access,
                cause: UnknownKeyCause::FetchFailed,
            },
            AuthRejection::InvalidIssuer(TokenType::Identity),
        ];
        for rejection in unauthenticated {
            assert_eq!(rejection.to_status().code(), Code::Unauthenticated);
        }

        assert_eq!(
            AuthRejection::AudienceMismatch(TokenType::Identity)
                .to_status()
                .code(),
            Code::PermissionDenied
        );
        assert_eq!(
            Status::from(AuthRejection::TenantMismatch).code(),
            Code::PermissionDenied
        );
    }

    #[test]
    fn test_status_message_is_coarse() {
        let status = AuthRejection::ExpiredToken(TokenType::Access).to_status();
        assert_eq!(status.message(), "Authentication required");
        assert!(!status.message().contains("access"));
    }

    #[test]
    fn test_display_names_token_type() {
        assert_eq!(
            AuthRejection::MissingToken(TokenType::Access).to_string(),
            "Missing access token"
        );
        assert_eq!(
            AuthRejection::BadSignature(TokenType::Identity).to_string(),
            "The identity token is invalid or expired"
        );
    }
}
