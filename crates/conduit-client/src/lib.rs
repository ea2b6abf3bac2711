//! Client side of the Conduit RPC framework.
//!
//! This crate provides:
//! - A typed client per procedure, built with [`ClientBuilder`]
//! - Unary, client-streaming, server-streaming and bidirectional calls
//! - gRPC (HTTP/2) and gRPC-Web (HTTP/1.1 or HTTP/2) framing
//! - A pluggable HTTP transport, hyper by default

pub mod client;
mod duplex;
mod protocol;
pub mod streams;
pub mod transport;

pub use client::{Client, ClientBuilder};
pub use streams::{BidiStreamCall, ClientStreamCall, ServerStreamCall};
pub use transport::{ClientConfig, HttpClient, HttpProtocol, HyperClient};
