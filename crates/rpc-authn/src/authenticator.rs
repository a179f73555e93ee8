//! Per-call authentication.
//!
//! The [`Authenticator`] pulls the identity and access tokens out of call
//! metadata, verifies the ones its policy requires, and returns the caller's
//! identity. It holds no per-call state and is shared across tasks.

use crate::auth::claims::{CallerIdentity, TokenType};
use crate::auth::key_cache::KeyCache;
use crate::auth::verifier::TokenVerifier;
use crate::errors::AuthRejection;
use crate::policy::{AuthPolicy, PolicyError};
use common::secret::{ExposeSecret, SecretString};
use std::sync::Arc;
use tracing::instrument;

/// Metadata key carrying the identity token.
pub const ID_TOKEN_METADATA_KEY: &str = "x-id-token";

/// Metadata key carrying the access token.
pub const ACCESS_TOKEN_METADATA_KEY: &str = "x-access-token";

/// Fallback location of the identity token, as `Bearer <token>`.
pub const AUTHORIZATION_METADATA_KEY: &str = "authorization";

/// Bearer tokens extracted from one call's metadata.
///
/// Token values are held as [`SecretString`] and never appear in Debug
/// output.
#[derive(Debug, Clone, Default)]
pub struct CallMetadata {
    id_token: Option<SecretString>,
    access_token: Option<SecretString>,
}

impl CallMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_id_token(mut self, token: impl Into<String>) -> Self {
        self.id_token = non_empty(token.into());
        self
    }

    #[must_use]
    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = non_empty(token.into());
        self
    }

    /// Collect tokens from metadata key/value pairs.
    ///
    /// Keys match case-insensitively. The identity token comes from
    /// `x-id-token`, or from an `authorization: Bearer` entry when that key
    /// is absent. Empty values count as absent.
    pub fn from_pairs<'a, I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut id_token = None;
        let mut bearer = None;
        let mut access_token = None;

        for (key, value) in pairs {
            if key.eq_ignore_ascii_case(ID_TOKEN_METADATA_KEY) {
                id_token = id_token.or_else(|| non_empty(value.trim().to_string()));
            } else if key.eq_ignore_ascii_case(ACCESS_TOKEN_METADATA_KEY) {
                access_token = access_token.or_else(|| non_empty(value.trim().to_string()));
            } else if key.eq_ignore_ascii_case(AUTHORIZATION_METADATA_KEY) {
                bearer = bearer.or_else(|| bearer_token(value));
            }
        }

        Self {
            id_token: id_token.or(bearer),
            access_token,
        }
    }

    pub fn id_token(&self) -> Option<&str> {
        self.id_token.as_ref().map(|t| t.expose_secret())
    }

    pub fn access_token(&self) -> Option<&str> {
        self.access_token.as_ref().map(|t| t.expose_secret())
    }

    fn token(&self, token_type: TokenType) -> Option<&str> {
        match token_type {
            TokenType::Identity => self.id_token(),
            TokenType::Access => self.access_token(),
        }
    }
}

fn non_empty(value: String) -> Option<SecretString> {
    if value.is_empty() {
        None
    } else {
        Some(SecretString::from(value))
    }
}

fn bearer_token(value: &str) -> Option<SecretString> {
    let (scheme, token) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    non_empty(token.trim().to_string())
}

/// Authenticates RPC calls under one immutable [`AuthPolicy`].
pub struct Authenticator {
    policy: AuthPolicy,
    verifier: TokenVerifier,
}

impl Authenticator {
    /// Create an authenticator.
    ///
    /// # Errors
    ///
    /// Returns `PolicyError::MissingKeyCache` if the policy verifies
    /// signatures and no key cache is given.
    pub fn new(policy: AuthPolicy, key_cache: Option<Arc<KeyCache>>) -> Result<Self, PolicyError> {
        if policy.verifies_signatures() && key_cache.is_none() {
            return Err(PolicyError::MissingKeyCache);
        }

        if !policy.verifies_signatures() {
            tracing::warn!(
                target: "authn.authenticator",
                mode = %policy.mode(),
                "Token signatures will NOT be verified"
            );
        }

        Ok(Self {
            policy,
            verifier: TokenVerifier::new(key_cache),
        })
    }

    pub fn policy(&self) -> &AuthPolicy {
        &self.policy
    }

    pub fn key_cache(&self) -> Option<&Arc<KeyCache>> {
        self.verifier.key_cache()
    }

    /// Authenticate one call.
    ///
    /// Every token the policy requires must be present and verify; a token
    /// the policy does not require is ignored even when present.
    ///
    /// # Errors
    ///
    /// Returns the first [`AuthRejection`] encountered. Missing tokens are
    /// reported before any verification work is done.
    #[instrument(skip_all, fields(mode = %self.policy.mode()))]
    pub async fn authenticate(
        &self,
        metadata: &CallMetadata,
    ) -> Result<CallerIdentity, AuthRejection> {
        let result = self.authenticate_tokens(metadata).await;

        match &result {
            Ok(identity) => tracing::debug!(
                target: "authn.authenticator",
                tenant = ?identity.tenant,
                service = ?identity.service,
                "Call authenticated"
            ),
            Err(rejection) => tracing::debug!(
                target: "authn.authenticator",
                reason = rejection.reason(),
                "Call rejected"
            ),
        }

        result
    }

    async fn authenticate_tokens(
        &self,
        metadata: &CallMetadata,
    ) -> Result<CallerIdentity, AuthRejection> {
        let id_token = self.required_token(metadata, TokenType::Identity)?;
        let access_token = self.required_token(metadata, TokenType::Access)?;

        let identity = match id_token {
            Some(token) => Some(
                self.verifier
                    .verify(token, &self.policy, TokenType::Identity)
                    .await?,
            ),
            None => None,
        };

        let access = match access_token {
            Some(token) => Some(
                self.verifier
                    .verify(token, &self.policy, TokenType::Access)
                    .await?,
            ),
            None => None,
        };

        match (identity, access) {
            (Some(identity), Some(access)) => {
                if let (Some(id_tenant), Some(access_tenant)) = (&identity.tenant, &access.tenant) {
                    if id_tenant != access_tenant {
                        tracing::debug!(
                            target: "authn.authenticator",
                            "Identity and access token tenants differ"
                        );
                        return Err(AuthRejection::TenantMismatch);
                    }
                }
                Ok(identity.with_access(access))
            }
            (Some(identity), None) => Ok(identity),
            (None, Some(access)) => Ok(access),
            // Policy construction guarantees at least one required token.
            (None, None) => Err(AuthRejection::MissingToken(TokenType::Identity)),
        }
    }

    /// The token of `token_type` if the policy requires it.
    fn required_token<'m>(
        &self,
        metadata: &'m CallMetadata,
        token_type: TokenType,
    ) -> Result<Option<&'m str>, AuthRejection> {
        let required = match token_type {
            TokenType::Identity => self.policy.requires_identity_token(),
            TokenType::Access => self.policy.requires_access_token(),
        };
        if !required {
            return Ok(None);
        }

        metadata
            .token(token_type)
            .map(Some)
            .ok_or(AuthRejection::MissingToken(token_type))
    }
}
