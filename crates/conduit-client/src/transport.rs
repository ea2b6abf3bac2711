//! HTTP transport used by clients.

use async_trait::async_trait;
use conduit_core::{BoxError, Body, Code, Error};
use http_body_util::BodyExt;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::{TokioExecutor, TokioTimer};
use std::fmt;
use std::time::Duration;

/// HTTP protocol version used on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpProtocol {
    /// HTTP/1.1 only. Enough for gRPC-Web, but not for bidirectional calls.
    Http1,
    /// HTTP/2 with prior knowledge
    Http2,
}

/// Connection settings for the built-in HTTP client.
///
/// Unset fields keep hyper's defaults.
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    /// HTTP protocol version; `None` picks HTTP/2 for gRPC and HTTP/1.1 for gRPC-Web
    pub http_protocol: Option<HttpProtocol>,
    /// How long an idle pooled connection is kept
    pub pool_idle_timeout: Option<Duration>,
    /// HTTP/2 only: ping interval, keeping long-lived streams alive
    pub http2_keep_alive_interval: Option<Duration>,
    /// HTTP/2 only: how long to wait for a ping acknowledgement
    pub http2_keep_alive_timeout: Option<Duration>,
}

/// Issues one streaming HTTP exchange.
///
/// The request body is produced while the call is in flight, so
/// implementations must not buffer it before sending headers.
#[async_trait]
pub trait HttpClient: Send + Sync + 'static {
    async fn request(&self, request: http::Request<Body>) -> Result<http::Response<Body>, Error>;
}

/// [`HttpClient`] backed by hyper's pooled client.
#[derive(Clone)]
pub struct HyperClient {
    client: Client<HttpConnector, Body>,
}

impl HyperClient {
    pub fn new(config: &ClientConfig, protocol: HttpProtocol) -> Self {
        let mut builder = Client::builder(TokioExecutor::new());
        builder.timer(TokioTimer::new());
        builder.pool_timer(TokioTimer::new());

        if let Some(timeout) = config.pool_idle_timeout {
            builder.pool_idle_timeout(timeout);
        }

        match protocol {
            HttpProtocol::Http1 => {
                builder.http2_only(false);
            }
            HttpProtocol::Http2 => {
                builder.http2_only(true);
                if let Some(interval) = config.http2_keep_alive_interval {
                    builder.http2_keep_alive_interval(interval);
                }
                if let Some(timeout) = config.http2_keep_alive_timeout {
                    builder.http2_keep_alive_timeout(timeout);
                }
            }
        }

        Self {
            client: builder.build_http(),
        }
    }
}

impl fmt::Debug for HyperClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HyperClient").finish_non_exhaustive()
    }
}

#[async_trait]
impl HttpClient for HyperClient {
    async fn request(&self, request: http::Request<Body>) -> Result<http::Response<Body>, Error> {
        let response = self.client.request(request).await.map_err(|err| {
            let code = if err.is_connect() {
                Code::Unavailable
            } else {
                Code::Unknown
            };
            Error::from_source(code, err)
        })?;
        Ok(response.map(|body| body.map_err(|err| Box::new(err) as BoxError).boxed_unsync()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_request() -> http::Request<Body> {
        // Port 9 (discard) is closed on test machines.
        http::Request::post("http://127.0.0.1:9/svc.S/M")
            .body(
                http_body_util::Empty::<bytes::Bytes>::new()
                    .map_err(|never| match never {})
                    .boxed_unsync(),
            )
            .unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert!(config.http_protocol.is_none());
        assert!(config.pool_idle_timeout.is_none());
        assert!(config.http2_keep_alive_interval.is_none());
        assert!(config.http2_keep_alive_timeout.is_none());
    }

    #[tokio::test]
    async fn test_connect_failure_is_unavailable() {
        let client = HyperClient::new(&ClientConfig::default(), HttpProtocol::Http1);
        let err = client.request(empty_request()).await.err().unwrap();
        assert_eq!(err.code(), Code::Unavailable);
    }

    #[tokio::test]
    async fn test_http2_keep_alive_config() {
        let config = ClientConfig {
            pool_idle_timeout: Some(Duration::from_secs(30)),
            http2_keep_alive_interval: Some(Duration::from_secs(10)),
            http2_keep_alive_timeout: Some(Duration::from_secs(20)),
            ..ClientConfig::default()
        };
        let client = HyperClient::new(&config, HttpProtocol::Http2);
        let err = client.request(empty_request()).await.err().unwrap();
        assert_eq!(err.code(), Code::Unavailable);
    }
}
