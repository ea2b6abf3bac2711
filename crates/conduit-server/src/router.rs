//! HTTP router for procedures
//!
//! Routes match the pattern: /{package}.{Service}/{Method}

use crate::handler::Handler;
use bytes::Bytes;
use conduit_core::{Body, BoxError};
use futures_util::future::{BoxFuture, FutureExt};
use http::StatusCode;
use http_body_util::{BodyExt, Empty};
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::Service;
use tracing::debug;

/// Routes requests to handlers by procedure path.
#[derive(Clone, Default)]
pub struct ServeMux {
    routes: Arc<HashMap<String, Handler>>,
}

impl ServeMux {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `/{procedure}`, replacing any previous one.
    pub fn handle(&mut self, handler: Handler) {
        let path = format!("/{}", handler.procedure());
        Arc::make_mut(&mut self.routes).insert(path, handler);
    }

    /// Paths with a registered handler, sorted.
    pub fn paths(&self) -> Vec<&str> {
        let mut paths: Vec<&str> = self.routes.keys().map(String::as_str).collect();
        paths.sort_unstable();
        paths
    }

    /// Route an incoming request.
    pub fn route(&self, request: http::Request<Body>) -> BoxFuture<'static, http::Response<Body>> {
        match self.routes.get(request.uri().path()) {
            Some(handler) => handler.handle(request),
            None => {
                debug!(path = %request.uri().path(), "no handler registered");
                let mut response = http::Response::new(
                    Empty::<Bytes>::new()
                        .map_err(|never| match never {})
                        .boxed_unsync(),
                );
                *response.status_mut() = StatusCode::NOT_FOUND;
                async move { response }.boxed()
            }
        }
    }
}

impl std::fmt::Debug for ServeMux {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServeMux")
            .field("paths", &self.paths())
            .finish()
    }
}

impl<B> Service<http::Request<B>> for ServeMux
where
    B: http_body::Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    type Response = http::Response<Body>;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: http::Request<B>) -> Self::Future {
        let request = request.map(|body| body.map_err(Into::into).boxed_unsync());
        self.route(request).map(Ok).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_core::{Request, Response};
    use http_body_util::Full;
    use prost_types::Duration;
    use tower::ServiceExt;

    fn echo(procedure: &str) -> Handler {
        Handler::builder(procedure).unary(|_ctx, request: Request<Duration>| async move {
            Ok(Response::new(request.into_message()))
        })
    }

    #[test]
    fn test_paths() {
        let mut mux = ServeMux::new();
        mux.handle(echo("acme.v1.Echo/Say"));
        mux.handle(echo("/acme.v1.Echo/Shout"));
        assert_eq!(mux.paths(), vec!["/acme.v1.Echo/Say", "/acme.v1.Echo/Shout"]);
    }

    #[tokio::test]
    async fn test_unknown_path_is_not_found() {
        let mut mux = ServeMux::new();
        mux.handle(echo("acme.v1.Echo/Say"));
        let request = http::Request::post("/acme.v1.Echo/Whisper")
            .header("content-type", "application/grpc")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let response = mux.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_known_path_reaches_handler() {
        let mut mux = ServeMux::new();
        mux.handle(echo("acme.v1.Echo/Say"));
        // Wrong content type, but the 415 proves the handler saw it.
        let request = http::Request::post("/acme.v1.Echo/Say")
            .header("content-type", "application/json")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let response = mux.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }
}
