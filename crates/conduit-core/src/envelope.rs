//! Length-prefixed message framing.
//!
//! Envelope format: [flags u8][length u32 big-endian][payload bytes]
//! Flags: COMPRESSED(bit 0), TRAILER(bit 7, gRPC-Web only)

use crate::code::Code;
use crate::codec::{Codec, Message};
use crate::compression::Compression;
use crate::error::{BoxError, Error};
use crate::header::{encode_trailer_block, merge_headers, parse_trailer_block};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use http::HeaderMap;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::BodyExt;
use std::sync::Arc;
use tracing::{debug, trace};

/// Length of the envelope prefix
pub const PREFIX_LEN: usize = 5;

/// HTTP body type used on both sides of a call
pub type Body = UnsyncBoxBody<Bytes, BoxError>;

/// Envelope flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvelopeFlags(u8);

impl EnvelopeFlags {
    pub const COMPRESSED: u8 = 0b0000_0001;
    pub const TRAILER: u8 = 0b1000_0000;

    pub fn new(flags: u8) -> Self {
        Self(flags)
    }

    pub fn empty() -> Self {
        Self(0)
    }

    pub fn is_compressed(&self) -> bool {
        self.0 & Self::COMPRESSED != 0
    }

    pub fn is_trailer(&self) -> bool {
        self.0 & Self::TRAILER != 0
    }

    /// True if any bit other than COMPRESSED and TRAILER is set.
    pub fn has_unknown_bits(&self) -> bool {
        self.0 & !(Self::COMPRESSED | Self::TRAILER) != 0
    }

    pub fn as_u8(&self) -> u8 {
        self.0
    }
}

/// One frame on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub flags: EnvelopeFlags,
    pub payload: Bytes,
}

impl Envelope {
    pub fn message(payload: Bytes, compressed: bool) -> Self {
        let flags = if compressed {
            EnvelopeFlags::COMPRESSED
        } else {
            0
        };
        Self {
            flags: EnvelopeFlags::new(flags),
            payload,
        }
    }

    pub fn trailer(block: Bytes) -> Self {
        Self {
            flags: EnvelopeFlags::new(EnvelopeFlags::TRAILER),
            payload: block,
        }
    }

    /// Encode prefix and payload into one buffer
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(PREFIX_LEN + self.payload.len());
        buf.put_u8(self.flags.as_u8());
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.payload);
        buf.freeze()
    }
}

/// Framing errors
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("protocol error: promised {expected} bytes in enveloped message, got {received} bytes")]
    Truncated { expected: usize, received: usize },

    #[error("message size {size} is larger than configured max {limit}")]
    TooLarge { size: usize, limit: usize },

    #[error("protocol error: invalid envelope flags {0:#04x}")]
    InvalidFlags(u8),

    #[error("protocol error: received compressed message without grpc-encoding")]
    CompressedWithoutEncoding,

    #[error("message of {0} bytes does not fit in an envelope")]
    Oversized(usize),
}

impl From<EnvelopeError> for Error {
    fn from(err: EnvelopeError) -> Self {
        let code = match err {
            EnvelopeError::TooLarge { .. } => Code::ResourceExhausted,
            EnvelopeError::Oversized(_) => Code::Internal,
            _ => Code::InvalidArgument,
        };
        Error::from_source(code, err)
    }
}

/// Incremental envelope parser over buffered bytes.
#[derive(Debug)]
pub struct EnvelopeParser {
    buffer: BytesMut,
    max_bytes: usize,
}

impl EnvelopeParser {
    /// Create a parser; `max_bytes` of 0 accepts any declared length.
    pub fn new(max_bytes: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            max_bytes,
        }
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Number of buffered bytes not yet consumed
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Try to parse one envelope from the buffer.
    pub fn parse(&mut self) -> Result<Option<Envelope>, EnvelopeError> {
        if self.buffer.len() < PREFIX_LEN {
            return Ok(None);
        }
        let flags = self.buffer[0];
        let len = u32::from_be_bytes([
            self.buffer[1],
            self.buffer[2],
            self.buffer[3],
            self.buffer[4],
        ]) as usize;
        if self.max_bytes > 0 && len > self.max_bytes {
            return Err(EnvelopeError::TooLarge {
                size: len,
                limit: self.max_bytes,
            });
        }
        if self.buffer.len() < PREFIX_LEN + len {
            return Ok(None);
        }
        self.buffer.advance(PREFIX_LEN);
        let payload = self.buffer.split_to(len).freeze();
        Ok(Some(Envelope {
            flags: EnvelopeFlags::new(flags),
            payload,
        }))
    }

    /// Error describing a partial envelope left over at end of input.
    pub fn truncation(&self) -> Option<EnvelopeError> {
        match self.buffer.len() {
            0 => None,
            received if received < PREFIX_LEN => Some(EnvelopeError::Truncated {
                expected: PREFIX_LEN,
                received,
            }),
            received => {
                let len = u32::from_be_bytes([
                    self.buffer[1],
                    self.buffer[2],
                    self.buffer[3],
                    self.buffer[4],
                ]) as usize;
                Some(EnvelopeError::Truncated {
                    expected: len,
                    received: received - PREFIX_LEN,
                })
            }
        }
    }
}

impl Default for EnvelopeParser {
    fn default() -> Self {
        Self::new(0)
    }
}

/// Reads envelopes from an HTTP body, collecting any HTTP trailers.
pub struct EnvelopeReader {
    body: Body,
    parser: EnvelopeParser,
    trailers: HeaderMap,
    eof: bool,
}

impl EnvelopeReader {
    pub fn new(body: Body, max_bytes: usize) -> Self {
        Self {
            body,
            parser: EnvelopeParser::new(max_bytes),
            trailers: HeaderMap::new(),
            eof: false,
        }
    }

    /// Next envelope, or `None` on a clean end of the body.
    pub async fn next_envelope(&mut self) -> Result<Option<Envelope>, Error> {
        loop {
            if let Some(envelope) = self.parser.parse()? {
                return Ok(Some(envelope));
            }
            if self.eof {
                return match self.parser.truncation() {
                    Some(err) => Err(err.into()),
                    None => Ok(None),
                };
            }
            self.pull().await?;
        }
    }

    /// Read and discard the rest of the body, keeping its trailers.
    pub async fn drain(&mut self) -> Result<(), Error> {
        while !self.eof {
            self.pull().await?;
        }
        Ok(())
    }

    /// HTTP trailers received so far.
    pub fn trailers(&self) -> &HeaderMap {
        &self.trailers
    }

    pub fn is_finished(&self) -> bool {
        self.eof
    }

    async fn pull(&mut self) -> Result<(), Error> {
        match self.body.frame().await {
            None => self.eof = true,
            Some(Ok(frame)) => match frame.into_data() {
                Ok(data) => self.parser.feed(&data),
                Err(frame) => {
                    if let Ok(trailers) = frame.into_trailers() {
                        merge_headers(&mut self.trailers, &trailers);
                    }
                }
            },
            Some(Err(err)) => {
                self.eof = true;
                return Err(Error::from_boxed(Code::Unknown, err));
            }
        }
        Ok(())
    }
}

/// What a [`MessageReader`] produced.
#[derive(Debug)]
pub enum Inbound {
    /// A message was decoded into the caller's buffer.
    Message,
    /// A gRPC-Web trailer envelope arrived; the stream is over.
    Trailers(HeaderMap),
    /// The body ended cleanly.
    End,
}

/// Decodes messages from envelopes: decompression, codec and the gRPC-Web
/// trailer envelope.
pub struct MessageReader {
    envelopes: EnvelopeReader,
    codec: Arc<dyn Codec>,
    compression: Option<Arc<dyn Compression>>,
    read_max_bytes: usize,
    web: bool,
}

impl MessageReader {
    pub fn new(
        body: Body,
        codec: Arc<dyn Codec>,
        compression: Option<Arc<dyn Compression>>,
        read_max_bytes: usize,
        web: bool,
    ) -> Self {
        Self {
            envelopes: EnvelopeReader::new(body, read_max_bytes),
            codec,
            compression,
            read_max_bytes,
            web,
        }
    }

    pub async fn read(&mut self, message: &mut dyn Message) -> Result<Inbound, Error> {
        let Some(envelope) = self.envelopes.next_envelope().await? else {
            return Ok(Inbound::End);
        };
        if envelope.flags.has_unknown_bits() || (envelope.flags.is_trailer() && !self.web) {
            return Err(EnvelopeError::InvalidFlags(envelope.flags.as_u8()).into());
        }
        let payload = if envelope.flags.is_compressed() {
            let compression = self
                .compression
                .as_ref()
                .ok_or(EnvelopeError::CompressedWithoutEncoding)?;
            compression.decompress(&envelope.payload, self.read_max_bytes)?
        } else {
            envelope.payload
        };
        if envelope.flags.is_trailer() {
            let trailers = parse_trailer_block(&payload).map_err(|err| {
                Error::new(
                    Code::InvalidArgument,
                    format!("gRPC-Web protocol error: received invalid trailers: {err}"),
                )
            })?;
            debug!(count = trailers.len(), "gRPC-Web trailers received");
            return Ok(Inbound::Trailers(trailers));
        }
        trace!(bytes = payload.len(), compressed = envelope.flags.is_compressed(), "envelope read");
        self.codec.unmarshal(&payload, message)?;
        Ok(Inbound::Message)
    }

    pub async fn drain(&mut self) -> Result<(), Error> {
        self.envelopes.drain().await
    }

    /// HTTP trailers seen on the body so far.
    pub fn http_trailers(&self) -> &HeaderMap {
        self.envelopes.trailers()
    }
}

/// Encodes messages and gRPC-Web trailers into envelopes.
#[derive(Clone)]
pub struct EnvelopeWriter {
    codec: Arc<dyn Codec>,
    compression: Option<Arc<dyn Compression>>,
    compress_min_bytes: usize,
}

impl EnvelopeWriter {
    pub fn new(
        codec: Arc<dyn Codec>,
        compression: Option<Arc<dyn Compression>>,
        compress_min_bytes: usize,
    ) -> Self {
        Self {
            codec,
            compression,
            compress_min_bytes,
        }
    }

    /// Marshal `message`, compressing when a compressor is configured and
    /// the payload reaches the size threshold.
    pub fn encode_message(&self, message: &dyn Message) -> Result<Bytes, Error> {
        let raw = self.codec.marshal(message)?;
        let envelope = match &self.compression {
            Some(compression) if raw.len() >= self.compress_min_bytes => {
                Envelope::message(compression.compress(&raw)?, true)
            }
            _ => Envelope::message(raw, false),
        };
        if envelope.payload.len() > u32::MAX as usize {
            return Err(EnvelopeError::Oversized(envelope.payload.len()).into());
        }
        Ok(envelope.encode())
    }

    /// Encode trailers as a gRPC-Web trailer envelope. Never compressed.
    pub fn encode_trailers(&self, trailers: &HeaderMap) -> Bytes {
        Envelope::trailer(encode_trailer_block(trailers)).encode()
    }
}
