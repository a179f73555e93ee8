//! Common utilities shared across the RPC authn crates.

#![warn(clippy::pedantic)]

/// Module for secret types that prevent accidental logging
pub mod secret;

/// Module for JWT utilities (size limits, unverified decoding, time checks)
pub mod jwt;
