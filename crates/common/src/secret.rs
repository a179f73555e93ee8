//! Secret types for protecting sensitive values from accidental logging.
//!
//! This module re-exports types from the [`secrecy`] crate. Raw bearer tokens
//! pulled out of RPC call metadata are held as `SecretString` from the moment
//! they are extracted until they are handed to the verifier.
//!
//! # Compile-Time Safety
//!
//! The key insight is that `SecretBox<T>` and `SecretString` implement `Debug`
//! with redaction, so any code that derives `Debug` on a struct containing secrets
//! will automatically get safe logging behavior. This makes it **impossible** to
//! accidentally log secrets via `{:?}` or tracing.
//!
//! # Memory Safety
//!
//! Secrets are automatically zeroized when dropped, preventing sensitive
//! data from lingering in memory after use.
//!
//! # Example
//!
//! ```rust
//! use common::secret::SecretString;
//! use secrecy::ExposeSecret;
//!
//! #[derive(Debug)]
//! struct CallTokens {
//!     caller: String,
//!     id_token: SecretString,  // Safe: Debug shows "[REDACTED]"
//! }
//!
//! let tokens = CallTokens {
//!     caller: "billing-api".to_string(),
//!     id_token: SecretString::from("eyJhbGciOi..."),
//! };
//!
//! // This is safe - the token is redacted
//! println!("{:?}", tokens);
//!
//! // To access the actual value, you must explicitly call expose_secret()
//! let raw: &str = tokens.id_token.expose_secret();
//! ```
//!
//! Use `SecretString` for identity tokens, access tokens, and any other
//! bearer credential read off the wire.

// Re-export the main types from secrecy
pub use secrecy::{ExposeSecret, SecretString};
