//! gRPC integration for tonic servers.
//!
//! [`GrpcAuthLayer`] authenticates every call before it reaches a service
//! handler. Handlers read the result with [`caller_identity`].

pub mod auth_layer;

pub use auth_layer::{caller_identity, GrpcAuthLayer, GrpcAuthService};
