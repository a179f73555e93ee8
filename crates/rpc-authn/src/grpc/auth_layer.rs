//! Tower middleware authenticating tonic calls.
//!
//! Tokens are read from the HTTP/2 request headers (`x-id-token`,
//! `x-access-token`, or `authorization: Bearer`) and checked by a shared
//! [`Authenticator`]. On success the [`CallerIdentity`] is inserted into the
//! request extensions; on failure the call is answered with a coarse gRPC
//! status and never reaches the inner service.

use crate::auth::claims::CallerIdentity;
use crate::authenticator::{Authenticator, CallMetadata};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tonic::body::BoxBody;
use tonic::codegen::http;
use tower::{Layer, Service};

/// Tower layer for gRPC authentication.
#[derive(Clone)]
pub struct GrpcAuthLayer {
    authenticator: Arc<Authenticator>,
}

impl GrpcAuthLayer {
    pub fn new(authenticator: Arc<Authenticator>) -> Self {
        Self { authenticator }
    }
}

impl<S> Layer<S> for GrpcAuthLayer {
    type Service = GrpcAuthService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        GrpcAuthService {
            inner,
            authenticator: Arc::clone(&self.authenticator),
        }
    }
}

/// Tower service produced by [`GrpcAuthLayer`].
#[derive(Clone)]
pub struct GrpcAuthService<S> {
    inner: S,
    authenticator: Arc<Authenticator>,
}

impl<S, ReqBody> Service<http::Request<ReqBody>> for GrpcAuthService<S>
where
    S: Service<http::Request<ReqBody>, Response = http::Response<BoxBody>>
        + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
    ReqBody: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: http::Request<ReqBody>) -> Self::Future {
        // The clone that was driven to readiness serves this call.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let authenticator = Arc::clone(&self.authenticator);

        let metadata = CallMetadata::from_pairs(req.headers().iter().filter_map(|(name, value)| {
            value.to_str().ok().map(|value| (name.as_str(), value))
        }));

        Box::pin(async move {
            let identity = match authenticator.authenticate(&metadata).await {
                Ok(identity) => identity,
                Err(rejection) => {
                    tracing::debug!(
                        target: "authn.grpc",
                        path = %req.uri().path(),
                        reason = rejection.reason(),
                        "Rejecting unauthenticated call"
                    );
                    return Ok(rejection.to_status().into_http());
                }
            };

            let (mut parts, body) = req.into_parts();
            parts.extensions.insert(identity);
            let req = http::Request::from_parts(parts, body);

            inner.call(req).await
        })
    }
}

/// The authenticated caller of a request that passed [`GrpcAuthLayer`].
pub fn caller_identity<T>(request: &tonic::Request<T>) -> Option<&CallerIdentity> {
    request.extensions().get::<CallerIdentity>()
}
