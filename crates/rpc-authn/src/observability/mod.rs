//! Observability for the authenticator.
//!
//! Provides metrics recording helpers. Logging uses `tracing` directly with
//! `authn.*` targets.

pub mod metrics;
