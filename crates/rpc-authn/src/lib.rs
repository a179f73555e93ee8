//! RPC Token Authenticator
//!
//! Verifies the identity and access tokens carried in RPC call metadata
//! against a cached set of signing keys fetched from the issuer's JWKS
//! endpoint.
//!
//! # Modules
//!
//! - `auth` - Claims, key sources, the key cache, and token verification
//! - `authenticator` - Per-call authentication under a policy
//! - `config` - Environment configuration
//! - `errors` - Rejection and key fetch error types
//! - `factory` - Authenticator construction
//! - `grpc` - Tower layer for tonic servers
//! - `observability` - Metrics
//! - `policy` - Validated authentication policy

pub mod auth;
pub mod authenticator;
pub mod config;
pub mod errors;
pub mod factory;
pub mod grpc;
pub mod observability;
pub mod policy;

pub use auth::{CallerIdentity, KeyCache, KeyCacheConfig, KeySet, KeySource, TokenType};
pub use authenticator::{Authenticator, CallMetadata};
pub use config::{Config, ConfigError};
pub use errors::{AuthRejection, FetchError};
pub use factory::{build_authenticator, in_process_authenticator};
pub use policy::{AuthPolicy, BadSignaturePolicy, DeploymentMode, PolicyError};
