//! Test utilities for the authn crates
//!
//! Provides deterministic signing keys, token claim builders, and a mocked
//! JWKS endpoint for exercising the authenticator end to end.

pub mod crypto_fixtures;
pub mod jwks_mock;
pub mod token_builders;

pub use crypto_fixtures::TestKeypair;
pub use jwks_mock::{JwksMock, JWKS_PATH};
pub use token_builders::TestTokenBuilder;
