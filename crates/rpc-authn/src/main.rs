//! `rpc-authn-check`: validate authenticator configuration and, optionally,
//! authenticate a pair of tokens against the live key endpoint.
//!
//! Reads the same `AUTHN_*` variables a service would. Tokens to check are
//! taken from `AUTHN_CHECK_ID_TOKEN` and `AUTHN_CHECK_ACCESS_TOKEN`.

use anyhow::Context;
use rpc_authn::{build_authenticator, CallMetadata, Config};
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const ID_TOKEN_VAR: &str = "AUTHN_CHECK_ID_TOKEN";
const ACCESS_TOKEN_VAR: &str = "AUTHN_CHECK_ACCESS_TOKEN";

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    init_tracing();

    let config = Config::from_env().context("failed to load configuration")?;
    info!(target: "authn.check", mode = %config.mode, "Configuration loaded successfully");

    let authenticator = build_authenticator(&config).context("failed to build authenticator")?;

    if let Some(key_cache) = authenticator.key_cache() {
        match key_cache.refresh().await {
            Ok(keys) => info!(
                target: "authn.check",
                endpoint = %key_cache.endpoint(),
                key_count = keys.len(),
                "Signing keys fetched"
            ),
            Err(e) => warn!(
                target: "authn.check",
                endpoint = %key_cache.endpoint(),
                error = %e,
                kind = e.kind(),
                "Signing key fetch failed"
            ),
        }
    }

    let id_token = std::env::var(ID_TOKEN_VAR).ok();
    let access_token = std::env::var(ACCESS_TOKEN_VAR).ok();
    if id_token.is_none() && access_token.is_none() {
        info!(target: "authn.check", "No tokens to check");
        return Ok(ExitCode::SUCCESS);
    }

    let mut metadata = CallMetadata::new();
    if let Some(token) = id_token {
        log_header("identity", &token);
        metadata = metadata.with_id_token(token);
    }
    if let Some(token) = access_token {
        log_header("access", &token);
        metadata = metadata.with_access_token(token);
    }

    match authenticator.authenticate(&metadata).await {
        Ok(identity) => {
            info!(
                target: "authn.check",
                tenant = ?identity.tenant,
                service = ?identity.service,
                scopes = ?identity.scopes,
                "Tokens accepted"
            );
            Ok(ExitCode::SUCCESS)
        }
        Err(rejection) => {
            error!(
                target: "authn.check",
                reason = rejection.reason(),
                error = %rejection,
                "Tokens rejected"
            );
            Ok(ExitCode::FAILURE)
        }
    }
}

/// Log the unverified header so a rejection can be matched to a key.
fn log_header(token_type: &str, token: &str) {
    match common::jwt::decode_header(token) {
        Ok(header) => info!(
            target: "authn.check",
            token_type,
            alg = %header.alg,
            kid = ?header.kid,
            "Checking token"
        ),
        Err(e) => warn!(target: "authn.check", token_type, error = %e, "Token header unreadable"),
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "warn,authn=info".into());

    let json = std::env::var("LOG_FORMAT").is_ok_and(|format| format.eq_ignore_ascii_case("json"));

    let (json_layer, text_layer) = if json {
        (Some(tracing_subscriber::fmt::layer().json()), None)
    } else {
        (None, Some(tracing_subscriber::fmt::layer()))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .init();
}
