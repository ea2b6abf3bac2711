//! Server side of the Conduit RPC framework.
//!
//! This crate provides:
//! - Typed handlers for the four call shapes, built with [`HandlerBuilder`]
//! - gRPC and gRPC-Web framing on the same route
//! - A path router usable as a `tower::Service`
//! - A hyper server runtime

pub mod handler;
mod protocol;
pub mod registrar;
pub mod router;
pub mod server;
pub mod streams;

pub use handler::{Handler, HandlerBuilder};
pub use registrar::Registrar;
pub use router::ServeMux;
pub use server::{Server, ServerBuilder};
pub use streams::{BidiStream, ClientStream, ServerStream};
