//! Token claims and the caller identity derived from them.
//!
//! Subjects are user or service identifiers and are redacted in Debug
//! output for both [`TokenClaims`] and [`CallerIdentity`].

use serde::{Deserialize, Serialize};
use std::fmt;

/// Which of the two bearer tokens a value refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenType {
    /// Identifies the calling principal. Present in every deployment mode.
    Identity,
    /// Carries the caller's authorization scopes. Cloud deployments only.
    Access,
}

impl TokenType {
    /// Stable lowercase label used in logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            TokenType::Identity => "identity",
            TokenType::Access => "access",
        }
    }
}

impl fmt::Display for TokenType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The `aud` claim, which issuers emit either as a string or an array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Audience {
    Single(String),
    Many(Vec<String>),
}

impl Audience {
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        let values: &[String] = match self {
            Audience::Single(value) => std::slice::from_ref(value),
            Audience::Many(values) => values,
        };
        values.iter().map(String::as_str)
    }
}

/// Registered and private claims read from an identity or access token.
///
/// `exp` and `sub` are required; a token without them fails to decode and
/// is rejected as structurally invalid.
#[derive(Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Subject - redacted in Debug output.
    pub sub: String,

    /// Expiration timestamp (Unix epoch seconds).
    pub exp: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nbf: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<Audience>,

    /// Tenant (namespace) the subject belongs to.
    #[serde(default, alias = "namespace", skip_serializing_if = "Option::is_none")]
    pub tenant: Option<String>,

    /// Space-separated scopes granted to this token.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub scope: String,
}

impl fmt::Debug for TokenClaims {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenClaims")
            .field("sub", &"[REDACTED]")
            .field("exp", &self.exp)
            .field("iat", &self.iat)
            .field("nbf", &self.nbf)
            .field("iss", &self.iss)
            .field("aud", &self.aud)
            .field("tenant", &self.tenant)
            .field("scope", &self.scope)
            .finish()
    }
}

impl TokenClaims {
    /// Audiences the token was minted for. Empty when `aud` is absent.
    pub fn audiences(&self) -> impl Iterator<Item = &str> {
        self.aud.iter().flat_map(Audience::iter)
    }

    pub fn has_scope(&self, scope: &str) -> bool {
        self.scope.split_whitespace().any(|s| s == scope)
    }

    pub fn scopes(&self) -> Vec<&str> {
        self.scope.split_whitespace().collect()
    }
}

/// The authenticated principal handed to RPC handlers.
#[derive(Clone, PartialEq, Eq)]
pub struct CallerIdentity {
    /// Subject of the identity token (or the access token when it is the
    /// only one required).
    pub subject: String,

    pub tenant: Option<String>,

    /// Scopes granted by the access token; identity tokens contribute scopes
    /// only when no access token is required.
    pub scopes: Vec<String>,

    /// The token the subject was taken from.
    pub token_type: TokenType,

    /// Subject of the access token, i.e. the service acting for the caller.
    pub service: Option<String>,
}

impl fmt::Debug for CallerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallerIdentity")
            .field("subject", &"[REDACTED]")
            .field("tenant", &self.tenant)
            .field("scopes", &self.scopes)
            .field("token_type", &self.token_type)
            .field("service", &self.service)
            .finish()
    }
}

impl CallerIdentity {
    /// Build an identity from claims that have already been verified.
    pub fn from_claims(claims: TokenClaims, token_type: TokenType) -> Self {
        let scopes = claims.scopes().into_iter().map(str::to_string).collect();
        Self {
            subject: claims.sub,
            tenant: claims.tenant,
            scopes,
            token_type,
            service: None,
        }
    }

    /// Fold a verified access token into this identity.
    ///
    /// The access token's scopes replace any carried by the identity token
    /// and its subject becomes the acting service. A tenant missing from
    /// the identity token is taken from the access token.
    pub fn with_access(mut self, access: CallerIdentity) -> Self {
        self.scopes = access.scopes;
        self.service = Some(access.subject);
        if self.tenant.is_none() {
            self.tenant = access.tenant;
        }
        self
    }

    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn claims(scope: &str) -> TokenClaims {
        TokenClaims {
            sub: "secret-user-id".to_string(),
            exp: 1_234_567_890,
            iat: Some(1_234_567_800),
            nbf: None,
            iss: None,
            aud: Some(Audience::Single("orders-api".to_string())),
            tenant: Some("stacks-42".to_string()),
            scope: scope.to_string(),
        }
    }

    #[test]
    fn test_claims_debug_redacts_sub() {
        let debug_str = format!("{:?}", claims("read"));

        assert!(
            !debug_str.contains("secret-user-id"),
            "Debug output should not contain actual sub value"
        );
        assert!(debug_str.contains("[REDACTED]"));
    }

    #[test]
    fn test_claims_has_scope() {
        let claims = claims("read write admin");

        assert!(claims.has_scope("read"));
        assert!(claims.has_scope("admin"));
        assert!(!claims.has_scope("delete"));
        assert!(!claims.has_scope("rea")); // Partial match should not work
        assert_eq!(claims.scopes(), vec!["read", "write", "admin"]);
    }

    #[test]
    fn test_claims_empty_scope() {
        let claims = claims("");
        assert!(!claims.has_scope("read"));
        assert!(claims.scopes().is_empty());
    }

    #[test]
    fn test_audience_accepts_string_or_array() {
        let single: TokenClaims =
            serde_json::from_str(r#"{"sub":"u","exp":1,"aud":"orders-api"}"#).unwrap();
        assert_eq!(single.audiences().collect::<Vec<_>>(), vec!["orders-api"]);

        let many: TokenClaims =
            serde_json::from_str(r#"{"sub":"u","exp":1,"aud":["a","b"]}"#).unwrap();
        assert_eq!(many.audiences().collect::<Vec<_>>(), vec!["a", "b"]);

        let none: TokenClaims = serde_json::from_str(r#"{"sub":"u","exp":1}"#).unwrap();
        assert_eq!(none.audiences().count(), 0);
    }

    #[test]
    fn test_tenant_accepts_namespace_alias() {
        let claims: TokenClaims =
            serde_json::from_str(r#"{"sub":"u","exp":1,"namespace":"stacks-7"}"#).unwrap();
        assert_eq!(claims.tenant.as_deref(), Some("stacks-7"));
    }

    #[test]
    fn test_claims_require_sub_and_exp() {
        assert!(serde_json::from_str::<TokenClaims>(r#"{"exp":1}"#).is_err());
        assert!(serde_json::from_str::<TokenClaims>(r#"{"sub":"u"}"#).is_err());
    }

    #[test]
    fn test_caller_identity_from_claims() {
        let identity = CallerIdentity::from_claims(claims("read write"), TokenType::Identity);

        assert_eq!(identity.subject, "secret-user-id");
        assert_eq!(identity.tenant.as_deref(), Some("stacks-42"));
        assert_eq!(identity.scopes, vec!["read", "write"]);
        assert!(identity.service.is_none());
        assert!(!format!("{:?}", identity).contains("secret-user-id"));
    }

    #[test]
    fn test_with_access_takes_scopes_and_service() {
        let identity = CallerIdentity::from_claims(claims("ignored"), TokenType::Identity);
        let mut access_claims = claims("dashboards:read");
        access_claims.sub = "access-policy:grafana".to_string();
        access_claims.tenant = None;
        let access = CallerIdentity::from_claims(access_claims, TokenType::Access);

        let merged = identity.with_access(access);

        assert_eq!(merged.scopes, vec!["dashboards:read"]);
        assert_eq!(merged.service.as_deref(), Some("access-policy:grafana"));
        assert_eq!(merged.tenant.as_deref(), Some("stacks-42"));
        assert_eq!(merged.token_type, TokenType::Identity);
        assert!(merged.has_scope("dashboards:read"));
    }

    #[test]
    fn test_token_type_labels() {
        assert_eq!(TokenType::Identity.to_string(), "identity");
        assert_eq!(TokenType::Access.as_str(), "access");
    }
}
