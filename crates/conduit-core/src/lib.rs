//! Core types and utilities for the Conduit RPC framework.
//!
//! This crate holds everything clients and handlers share:
//! - Status codes and the error model
//! - Envelope framing and gRPC-Web trailer blocks
//! - Codec and compression registries
//! - Header and timeout encodings
//! - Stream capabilities and interceptors

pub mod code;
pub mod codec;
pub mod compression;
pub mod context;
pub mod envelope;
pub mod error;
pub mod header;
pub mod interceptor;
pub mod message;
pub mod protocol;
pub mod spec;
pub mod status;
pub mod stream;
pub mod timeout;

pub use code::Code;
pub use codec::{Codec, Codecs, Message, ProtoBinaryCodec, CODEC_NAME_PROTO};
pub use compression::{
    Compression, Compressors, GzipCompression, ZstdCompression, COMPRESSION_GZIP,
    COMPRESSION_IDENTITY, COMPRESSION_ZSTD,
};
pub use context::CallContext;
pub use envelope::{Body, Envelope, EnvelopeFlags, EnvelopeParser};
pub use error::{BoxError, Error};
pub use header::MetadataExt;
pub use interceptor::{unary_fn, Chain, ErrorTranslator, HeaderInterceptor, Interceptor, UnaryFunc};
pub use message::{AnyRequest, AnyResponse, Request, Response};
pub use protocol::Protocol;
pub use spec::{Specification, StreamType};
pub use stream::{NopReceiver, NopSender, Receiver, Sender};

/// Default cap on a single inbound message, after decompression.
pub const DEFAULT_READ_MAX_BYTES: usize = 4 * 1024 * 1024;

/// Payloads smaller than this are sent uncompressed by default.
pub const DEFAULT_COMPRESS_MIN_BYTES: usize = 1024;
