//! Authenticator construction from configuration.

use crate::auth::jwks::HttpKeySource;
use crate::auth::key_cache::KeyCache;
use crate::authenticator::Authenticator;
use crate::config::{Config, ConfigError};
use crate::policy::{AuthPolicy, DeploymentMode, PolicyError};
use std::sync::Arc;

/// Build a verifying authenticator for a cloud or on-prem deployment.
///
/// The policy is validated before any client is built, so an invalid
/// combination fails without touching the network.
///
/// # Errors
///
/// Returns `ConfigError::Policy` for an invalid policy and
/// `ConfigError::HttpClient` if the key endpoint client cannot be built.
pub fn build_authenticator(config: &Config) -> Result<Authenticator, ConfigError> {
    let policy = config.auth_policy()?;

    let source = HttpKeySource::new(config.signing_keys_url.clone(), config.key_source_options())
        .map_err(|e| ConfigError::HttpClient(e.to_string()))?;
    let key_cache = Arc::new(KeyCache::new(Arc::new(source), config.key_cache_config()));

    tracing::info!(
        target: "authn.factory",
        mode = %config.mode,
        environment = %config.environment,
        signing_keys_url = %config.signing_keys_url,
        access_token_required = config.access_token_required,
        "Authenticator configured"
    );

    Ok(Authenticator::new(policy, Some(key_cache))?)
}

/// Build an authenticator for callers inside the same trust boundary.
///
/// Only the identity token is required and its signature is not checked;
/// expiry and audience still are.
///
/// # Errors
///
/// Returns `PolicyError::NoAudiences` if `audiences` is empty.
pub fn in_process_authenticator<I, S>(audiences: I) -> Result<Authenticator, PolicyError>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let policy = AuthPolicy::builder(DeploymentMode::InProcess)
        .allowed_audiences(audiences)
        .require_identity_token(true)
        .require_access_token(false)
        .skip_signature_verification(true)
        .build()?;

    Authenticator::new(policy, None)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_build_cloud_authenticator() {
        let config = Config::from_vars(&vars(&[
            (
                "AUTHN_SIGNING_KEYS_URL",
                "https://keys.example.com/.well-known/jwks.json",
            ),
            ("AUTHN_ALLOWED_AUDIENCES", "orders-api"),
        ]))
        .unwrap();

        let authenticator = build_authenticator(&config).unwrap();

        let policy = authenticator.policy();
        assert_eq!(policy.mode(), DeploymentMode::Cloud);
        assert!(policy.requires_identity_token());
        assert!(policy.requires_access_token());
        assert!(policy.verifies_signatures());
        assert_eq!(
            authenticator.key_cache().unwrap().endpoint(),
            "https://keys.example.com/.well-known/jwks.json"
        );
    }

    #[test]
    fn test_build_on_prem_authenticator() {
        let config = Config::from_vars(&vars(&[
            (
                "AUTHN_SIGNING_KEYS_URL",
                "https://keys.internal/.well-known/jwks.json",
            ),
            ("AUTHN_ALLOWED_AUDIENCES", "orders-api"),
            ("AUTHN_MODE", "on-prem"),
        ]))
        .unwrap();

        let authenticator = build_authenticator(&config).unwrap();

        assert_eq!(authenticator.policy().mode(), DeploymentMode::OnPrem);
        assert!(authenticator.policy().requires_identity_token());
        assert!(!authenticator.policy().requires_access_token());
    }

    #[test]
    fn test_build_rejects_invalid_combination() {
        let config = Config::from_vars(&vars(&[
            (
                "AUTHN_SIGNING_KEYS_URL",
                "https://keys.internal/.well-known/jwks.json",
            ),
            ("AUTHN_ALLOWED_AUDIENCES", "orders-api"),
            ("AUTHN_MODE", "on-prem"),
            ("AUTHN_ACCESS_TOKEN_REQUIRED", "true"),
        ]))
        .unwrap();

        assert!(matches!(
            build_authenticator(&config),
            Err(ConfigError::Policy(PolicyError::AccessTokenOnPrem))
        ));
    }

    #[test]
    fn test_in_process_authenticator() {
        let authenticator = in_process_authenticator(["orders-api"]).unwrap();

        let policy = authenticator.policy();
        assert_eq!(policy.mode(), DeploymentMode::InProcess);
        assert!(!policy.verifies_signatures());
        assert!(policy.requires_identity_token());
        assert!(!policy.requires_access_token());
        assert!(authenticator.key_cache().is_none());
    }

    #[test]
    fn test_in_process_authenticator_requires_audience() {
        let result = in_process_authenticator(Vec::<String>::new());
        assert!(matches!(result, Err(PolicyError::NoAudiences)));
    }
}
