//! Authenticator configuration.
//!
//! Configuration is loaded from environment variables. Nothing here is
//! secret, so the derived Debug output is safe to log.

use crate::auth::jwks::{HttpKeySourceOptions, DEFAULT_FETCH_TIMEOUT};
use crate::auth::key_cache::{
    KeyCacheConfig, DEFAULT_CACHE_TTL, DEFAULT_GRACE_PERIOD, DEFAULT_MIN_REFRESH_INTERVAL,
};
use crate::policy::{
    AuthPolicy, BadSignaturePolicy, DeploymentMode, PolicyError, DEFAULT_BAD_SIGNATURE_THRESHOLD,
};
use common::jwt::{DEFAULT_CLOCK_SKEW, MAX_CLOCK_SKEW};
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Deployment environment. Only development may relax TLS verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Production,
    Development,
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Environment::Production => f.write_str("production"),
            Environment::Development => f.write_str("development"),
        }
    }
}

impl FromStr for Environment {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "production" | "prod" => Ok(Environment::Production),
            "development" | "dev" => Ok(Environment::Development),
            _ => Err(()),
        }
    }
}

/// Authenticator configuration loaded from `AUTHN_*` variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// URL of the JWKS document with the issuer's signing keys.
    pub signing_keys_url: String,

    /// Audiences accepted in the `aud` claim.
    pub allowed_audiences: Vec<String>,

    /// Issuers accepted in the `iss` claim; empty accepts any.
    pub allowed_issuers: Vec<String>,

    /// Cloud or on-prem. In-process authenticators are not built from
    /// configuration.
    pub mode: DeploymentMode,

    pub environment: Environment,

    /// Whether calls must carry a verified access token.
    pub access_token_required: bool,

    /// Skip TLS certificate checks on the key endpoint (development only).
    pub insecure_skip_tls_verify: bool,

    pub key_cache_ttl_seconds: u64,

    pub key_grace_seconds: u64,

    pub key_fetch_timeout_seconds: u64,

    /// JWT clock skew tolerance in seconds for `nbf` and `iat`.
    pub jwt_clock_skew_seconds: u64,

    /// Bad signatures per cached kid before the key set is dropped; 0 disables.
    pub bad_signature_threshold: u32,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid signing keys URL: {0}")]
    InvalidSigningKeysUrl(String),

    #[error("Invalid deployment mode: {0}")]
    InvalidMode(String),

    #[error("Invalid environment: {0}")]
    InvalidEnvironment(String),

    #[error("Invalid boolean value: {0}")]
    InvalidBool(String),

    #[error("Invalid duration configuration: {0}")]
    InvalidDuration(String),

    #[error("Invalid JWT clock skew configuration: {0}")]
    InvalidJwtClockSkew(String),

    #[error("Invalid bad signature threshold: {0}")]
    InvalidBadSignatureThreshold(String),

    #[error("Insecure TLS is only allowed in development, not {0}")]
    InsecureTlsNotAllowed(Environment),

    #[error("Invalid auth policy: {0}")]
    Policy(#[from] PolicyError),

    #[error("Failed to build signing key client: {0}")]
    HttpClient(String),
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a HashMap (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let environment = match vars.get("AUTHN_ENVIRONMENT") {
            Some(value) => Environment::from_str(value).map_err(|()| {
                ConfigError::InvalidEnvironment(format!(
                    "AUTHN_ENVIRONMENT must be 'production' or 'development', got '{}'",
                    value
                ))
            })?,
            None => Environment::Production,
        };

        let signing_keys_url = vars
            .get("AUTHN_SIGNING_KEYS_URL")
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty())
            .ok_or_else(|| ConfigError::MissingEnvVar("AUTHN_SIGNING_KEYS_URL".to_string()))?;
        validate_url(&signing_keys_url, environment)?;

        let allowed_audiences = parse_list(vars.get("AUTHN_ALLOWED_AUDIENCES"));
        if allowed_audiences.is_empty() {
            return Err(ConfigError::MissingEnvVar(
                "AUTHN_ALLOWED_AUDIENCES".to_string(),
            ));
        }

        let allowed_issuers = parse_list(vars.get("AUTHN_ALLOWED_ISSUERS"));

        let mode = match vars.get("AUTHN_MODE") {
            Some(value) => match DeploymentMode::from_str(value) {
                Ok(DeploymentMode::InProcess) => {
                    return Err(ConfigError::InvalidMode(
                        "AUTHN_MODE 'in-process' cannot be configured from the environment"
                            .to_string(),
                    ))
                }
                Ok(mode) => mode,
                Err(e) => return Err(ConfigError::InvalidMode(e)),
            },
            None => DeploymentMode::Cloud,
        };

        let access_token_required = parse_bool(vars, "AUTHN_ACCESS_TOKEN_REQUIRED")?
            .unwrap_or(mode == DeploymentMode::Cloud);

        let insecure_skip_tls_verify =
            parse_bool(vars, "AUTHN_INSECURE_SKIP_TLS_VERIFY")?.unwrap_or(false);
        if insecure_skip_tls_verify && environment != Environment::Development {
            return Err(ConfigError::InsecureTlsNotAllowed(environment));
        }

        let key_cache_ttl_seconds =
            parse_seconds(vars, "AUTHN_KEY_CACHE_TTL_SECONDS", DEFAULT_CACHE_TTL, 1)?;
        let key_grace_seconds = parse_seconds(vars, "AUTHN_KEY_GRACE_SECONDS", DEFAULT_GRACE_PERIOD, 0)?;
        let key_fetch_timeout_seconds =
            parse_seconds(vars, "AUTHN_KEY_FETCH_TIMEOUT_SECONDS", DEFAULT_FETCH_TIMEOUT, 1)?;

        // Parse JWT clock skew tolerance with validation
        let jwt_clock_skew_seconds = if let Some(value_str) = vars.get("AUTHN_JWT_CLOCK_SKEW_SECONDS") {
            let value: i64 = value_str.trim().parse().map_err(|e| {
                ConfigError::InvalidJwtClockSkew(format!(
                    "AUTHN_JWT_CLOCK_SKEW_SECONDS must be a valid integer, got '{}': {}",
                    value_str, e
                ))
            })?;

            let value = u64::try_from(value).ok().filter(|v| *v > 0).ok_or_else(|| {
                ConfigError::InvalidJwtClockSkew(format!(
                    "AUTHN_JWT_CLOCK_SKEW_SECONDS must be positive, got {}",
                    value
                ))
            })?;

            if value > MAX_CLOCK_SKEW.as_secs() {
                return Err(ConfigError::InvalidJwtClockSkew(format!(
                    "AUTHN_JWT_CLOCK_SKEW_SECONDS must not exceed {} seconds, got {}",
                    MAX_CLOCK_SKEW.as_secs(),
                    value
                )));
            }

            value
        } else {
            DEFAULT_CLOCK_SKEW.as_secs()
        };

        let bad_signature_threshold = match vars.get("AUTHN_BAD_SIGNATURE_THRESHOLD") {
            Some(value_str) => value_str.trim().parse().map_err(|e| {
                ConfigError::InvalidBadSignatureThreshold(format!(
                    "AUTHN_BAD_SIGNATURE_THRESHOLD must be a non-negative integer, got '{}': {}",
                    value_str, e
                ))
            })?,
            None => DEFAULT_BAD_SIGNATURE_THRESHOLD,
        };

        Ok(Config {
            signing_keys_url,
            allowed_audiences,
            allowed_issuers,
            mode,
            environment,
            access_token_required,
            insecure_skip_tls_verify,
            key_cache_ttl_seconds,
            key_grace_seconds,
            key_fetch_timeout_seconds,
            jwt_clock_skew_seconds,
            bad_signature_threshold,
        })
    }

    /// Build the validated policy this configuration describes.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Policy` for combinations the deployment mode
    /// does not allow, e.g. requiring access tokens on-prem.
    pub fn auth_policy(&self) -> Result<AuthPolicy, ConfigError> {
        let policy = AuthPolicy::builder(self.mode)
            .allowed_audiences(self.allowed_audiences.iter().cloned())
            .allowed_issuers(self.allowed_issuers.iter().cloned())
            .signing_keys_url(self.signing_keys_url.clone())
            .require_identity_token(true)
            .require_access_token(self.access_token_required)
            .clock_skew(Duration::from_secs(self.jwt_clock_skew_seconds))
            .bad_signature_policy(BadSignaturePolicy::from_threshold(
                self.bad_signature_threshold,
            ))
            .build()?;
        Ok(policy)
    }

    pub fn key_cache_config(&self) -> KeyCacheConfig {
        KeyCacheConfig {
            ttl: Duration::from_secs(self.key_cache_ttl_seconds),
            grace_period: Duration::from_secs(self.key_grace_seconds),
            min_refresh_interval: DEFAULT_MIN_REFRESH_INTERVAL,
        }
    }

    pub fn key_source_options(&self) -> HttpKeySourceOptions {
        HttpKeySourceOptions {
            timeout: Duration::from_secs(self.key_fetch_timeout_seconds),
            insecure_skip_tls_verify: self.insecure_skip_tls_verify,
        }
    }
}

fn validate_url(url: &str, environment: Environment) -> Result<(), ConfigError> {
    let is_https = url.starts_with("https://");
    if !is_https && !url.starts_with("http://") {
        return Err(ConfigError::InvalidSigningKeysUrl(format!(
            "AUTHN_SIGNING_KEYS_URL must be an http(s) URL, got '{}'",
            url
        )));
    }
    if !is_https && environment == Environment::Production {
        return Err(ConfigError::InvalidSigningKeysUrl(
            "AUTHN_SIGNING_KEYS_URL must use https in production".to_string(),
        ));
    }
    Ok(())
}

fn parse_list(value: Option<&String>) -> Vec<String> {
    value
        .map(|list| {
            list.split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn parse_bool(vars: &HashMap<String, String>, name: &str) -> Result<Option<bool>, ConfigError> {
    let Some(value) = vars.get(name) else {
        return Ok(None);
    };
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(Some(true)),
        "false" | "0" | "no" => Ok(Some(false)),
        _ => Err(ConfigError::InvalidBool(format!(
            "{} must be true or false, got '{}'",
            name, value
        ))),
    }
}

/// Upper bound for any duration setting (one day).
pub const MAX_DURATION_SECONDS: u64 = 86_400;

fn parse_seconds(
    vars: &HashMap<String, String>,
    name: &str,
    default: Duration,
    min: u64,
) -> Result<u64, ConfigError> {
    let Some(value_str) = vars.get(name) else {
        return Ok(default.as_secs());
    };

    let value: u64 = value_str.trim().parse().map_err(|e| {
        ConfigError::InvalidDuration(format!(
            "{} must be a valid non-negative integer, got '{}': {}",
            name, value_str, e
        ))
    })?;

    if value < min {
        return Err(ConfigError::InvalidDuration(format!(
            "{} must be at least {}, got {}",
            name, min, value
        )));
    }

    if value > MAX_DURATION_SECONDS {
        return Err(ConfigError::InvalidDuration(format!(
            "{} must be at most {}, got {}",
            name, MAX_DURATION_SECONDS, value
        )));
    }

    Ok(value)
}
