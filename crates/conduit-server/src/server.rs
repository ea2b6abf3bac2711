//! Conduit server implementation

use crate::handler::Handler;
use crate::router::ServeMux;
use http::Request;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::convert::Infallible;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{error, info};

/// RPC server speaking gRPC over HTTP/2 and gRPC-Web over HTTP/1.1 or
/// HTTP/2 on the same port.
#[derive(Debug, Clone)]
pub struct Server {
    mux: ServeMux,
}

impl Server {
    pub fn new(mux: ServeMux) -> Self {
        Self { mux }
    }

    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    pub fn mux(&self) -> &ServeMux {
        &self.mux
    }

    /// Bind `addr` and serve until the listener fails.
    pub async fn serve(self, addr: SocketAddr) -> std::io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve_listener(listener).await
    }

    /// Serve connections accepted from an already bound listener.
    pub async fn serve_listener(self, listener: TcpListener) -> std::io::Result<()> {
        info!("Conduit server listening on {}", listener.local_addr()?);

        loop {
            let (stream, remote_addr) = listener.accept().await?;
            let mux = self.mux.clone();

            tokio::spawn(async move {
                let io = TokioIo::new(stream);

                let service = hyper::service::service_fn(move |req: Request<Incoming>| {
                    let request = req.map(|body| body.map_err(Into::into).boxed_unsync());
                    let response = mux.route(request);
                    async move { Ok::<_, Infallible>(response.await) }
                });

                if let Err(err) = auto::Builder::new(TokioExecutor::new())
                    .serve_connection(io, service)
                    .await
                {
                    error!("Error serving connection from {}: {}", remote_addr, err);
                }
            });
        }
    }
}

/// Builder for creating a server
#[derive(Debug, Default)]
pub struct ServerBuilder {
    mux: ServeMux,
}

impl ServerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route requests for the handler's procedure to it.
    pub fn register(mut self, handler: Handler) -> Self {
        self.mux.handle(handler);
        self
    }

    pub fn build(self) -> Server {
        Server::new(self.mux)
    }
}
