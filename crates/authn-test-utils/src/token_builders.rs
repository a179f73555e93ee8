//! Builder patterns for test data construction
//!
//! Provides a fluent API for the claims of identity and access tokens.

use chrono::{Duration, Utc};
use serde_json::{json, Map, Value};

/// Builder for creating test JWT claims
///
/// Defaults to a token for `test-subject` in tenant `test-tenant`, audience
/// `test-audience`, issued now and valid for an hour.
///
/// # Example
/// ```rust,ignore
/// let claims = TestTokenBuilder::new()
///     .for_user("alice")
///     .with_audience("orders-api")
///     .with_scope("orders.read orders.write")
///     .expires_in(3600)
///     .build();
/// ```
pub struct TestTokenBuilder {
    sub: String,
    aud: Option<Value>,
    iss: Option<String>,
    tenant: Option<String>,
    scope: String,
    exp: i64,
    iat: Option<i64>,
    nbf: Option<i64>,
}

impl TestTokenBuilder {
    /// Create a new token builder with defaults
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            sub: "test-subject".to_string(),
            aud: Some(json!("test-audience")),
            iss: None,
            tenant: Some("test-tenant".to_string()),
            scope: "".to_string(),
            exp: (now + Duration::seconds(3600)).timestamp(),
            iat: Some(now.timestamp()),
            nbf: None,
        }
    }

    /// Set the subject (user/service)
    pub fn for_user(mut self, subject: &str) -> Self {
        self.sub = subject.to_string();
        self
    }

    pub fn with_audience(mut self, audience: &str) -> Self {
        self.aud = Some(json!(audience));
        self
    }

    /// Set the audience to a list
    pub fn with_audiences(mut self, audiences: &[&str]) -> Self {
        self.aud = Some(json!(audiences));
        self
    }

    pub fn without_audience(mut self) -> Self {
        self.aud = None;
        self
    }

    pub fn with_issuer(mut self, issuer: &str) -> Self {
        self.iss = Some(issuer.to_string());
        self
    }

    pub fn with_tenant(mut self, tenant: &str) -> Self {
        self.tenant = Some(tenant.to_string());
        self
    }

    pub fn without_tenant(mut self) -> Self {
        self.tenant = None;
        self
    }

    /// Set the scope (space-separated)
    pub fn with_scope(mut self, scope: &str) -> Self {
        self.scope = scope.to_string();
        self
    }

    /// Set expiration in seconds from now (negative for an expired token)
    pub fn expires_in(mut self, seconds: i64) -> Self {
        self.exp = (Utc::now() + Duration::seconds(seconds)).timestamp();
        self
    }

    /// Set issued-at timestamp
    pub fn issued_at(mut self, timestamp: i64) -> Self {
        self.iat = Some(timestamp);
        self
    }

    /// Set not-before in seconds from now
    pub fn not_before_in(mut self, seconds: i64) -> Self {
        self.nbf = Some((Utc::now() + Duration::seconds(seconds)).timestamp());
        self
    }

    /// Build the claims as a JSON value
    pub fn build(self) -> Value {
        let mut claims = Map::new();
        claims.insert("sub".to_string(), json!(self.sub));
        claims.insert("exp".to_string(), json!(self.exp));
        claims.insert("scope".to_string(), json!(self.scope));
        if let Some(aud) = self.aud {
            claims.insert("aud".to_string(), aud);
        }
        if let Some(iss) = self.iss {
            claims.insert("iss".to_string(), json!(iss));
        }
        if let Some(tenant) = self.tenant {
            claims.insert("tenant".to_string(), json!(tenant));
        }
        if let Some(iat) = self.iat {
            claims.insert("iat".to_string(), json!(iat));
        }
        if let Some(nbf) = self.nbf {
            claims.insert("nbf".to_string(), json!(nbf));
        }
        Value::Object(claims)
    }
}

impl Default for TestTokenBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let claims = TestTokenBuilder::new().build();

        assert_eq!(claims["sub"], "test-subject");
        assert_eq!(claims["aud"], "test-audience");
        assert_eq!(claims["tenant"], "test-tenant");
        assert!(claims["exp"].as_i64().unwrap() > Utc::now().timestamp());
        assert!(claims.get("iss").is_none());
        assert!(claims.get("nbf").is_none());
    }

    #[test]
    fn test_builder_custom_values() {
        let claims = TestTokenBuilder::new()
            .for_user("alice")
            .with_audiences(&["orders-api", "billing-api"])
            .with_issuer("https://issuer.example.com")
            .with_tenant("stacks-9")
            .with_scope("orders.read")
            .not_before_in(60)
            .build();

        assert_eq!(claims["sub"], "alice");
        assert_eq!(claims["aud"][1], "billing-api");
        assert_eq!(claims["iss"], "https://issuer.example.com");
        assert_eq!(claims["tenant"], "stacks-9");
        assert_eq!(claims["scope"], "orders.read");
        assert!(claims["nbf"].as_i64().unwrap() > Utc::now().timestamp());
    }

    #[test]
    fn test_builder_expired_and_without_fields() {
        let claims = TestTokenBuilder::new()
            .expires_in(-60)
            .without_audience()
            .without_tenant()
            .build();

        assert!(claims["exp"].as_i64().unwrap() < Utc::now().timestamp());
        assert!(claims.get("aud").is_none());
        assert!(claims.get("tenant").is_none());
    }
}
