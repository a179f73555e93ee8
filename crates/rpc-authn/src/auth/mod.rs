//! Token verification and signing-key management.
//!
//! - `claims`: token claims and the resulting caller identity
//! - `jwks`: key sources and JWK normalization
//! - `key_cache`: shared key cache with singleflight refresh
//! - `verifier`: per-token verification steps

pub mod claims;
pub mod jwks;
pub mod key_cache;
pub mod verifier;

pub use claims::{Audience, CallerIdentity, TokenClaims, TokenType};
pub use jwks::{HttpKeySource, HttpKeySourceOptions, Jwk, JwksResponse, KeySet, KeySource, SigningKey};
pub use key_cache::{KeyCache, KeyCacheConfig, KeyLookupError};
pub use verifier::TokenVerifier;
