//! Serve the ping service.
//!
//! Usage: `ping-demo [ADDR]`, listening on 127.0.0.1:8080 by default.
//! Log verbosity follows `RUST_LOG`.

use std::io;
use std::net::SocketAddr;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let addr: SocketAddr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:8080".to_string())
        .parse()
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;

    ping_demo::server(|builder| builder.zstd()).serve(addr).await
}
