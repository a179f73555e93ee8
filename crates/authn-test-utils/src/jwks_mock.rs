//! Mocked JWKS endpoint
//!
//! Wraps a `wiremock` server that answers `GET /.well-known/jwks.json` and
//! records how many key fetches it received.

use crate::crypto_fixtures::{jwks_json, TestKeypair};
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Path the mock serves the key set on.
pub const JWKS_PATH: &str = "/.well-known/jwks.json";

/// A JWKS endpoint whose response can be swapped between fetches.
///
/// Every `serve_*` call replaces the previous response and resets the
/// fetch count.
pub struct JwksMock {
    server: MockServer,
}

impl JwksMock {
    /// Start a mock endpoint that serves nothing until told to.
    pub async fn start() -> Self {
        Self {
            server: MockServer::start().await,
        }
    }

    /// Start a mock endpoint already serving `keys`.
    pub async fn with_keys(keys: &[&TestKeypair]) -> Self {
        let mock = Self::start().await;
        mock.serve_keys(keys).await;
        mock
    }

    /// Full URL of the key set document.
    pub fn url(&self) -> String {
        format!("{}{}", self.server.uri(), JWKS_PATH)
    }

    pub async fn serve_keys(&self, keys: &[&TestKeypair]) {
        self.serve_json(jwks_json(keys)).await;
    }

    /// Serve an arbitrary JSON body with status 200.
    pub async fn serve_json(&self, body: serde_json::Value) {
        self.serve(ResponseTemplate::new(200).set_body_json(body))
            .await;
    }

    /// Serve `keys` after a delay, for timeout and concurrency tests.
    pub async fn serve_keys_delayed(&self, keys: &[&TestKeypair], delay: Duration) {
        self.serve(
            ResponseTemplate::new(200)
                .set_body_json(jwks_json(keys))
                .set_delay(delay),
        )
        .await;
    }

    /// Answer every fetch with an error status.
    pub async fn serve_status(&self, status: u16) {
        self.serve(ResponseTemplate::new(status)).await;
    }

    /// Serve a body that is not a JWKS document.
    pub async fn serve_garbage(&self) {
        self.serve(ResponseTemplate::new(200).set_body_string("not json"))
            .await;
    }

    /// Number of key fetches received since the response was last set.
    pub async fn fetch_count(&self) -> usize {
        self.server
            .received_requests()
            .await
            .map(|requests| requests.len())
            .unwrap_or(0)
    }

    async fn serve(&self, response: ResponseTemplate) {
        self.server.reset().await;
        Mock::given(method("GET"))
            .and(path(JWKS_PATH))
            .respond_with(response)
            .mount(&self.server)
            .await;
    }
}
