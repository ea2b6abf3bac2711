//! Pluggable message codecs.

use crate::code::Code;
use crate::error::Error;
use bytes::Bytes;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Name of the protobuf binary codec, as it appears in content types.
pub const CODEC_NAME_PROTO: &str = "proto";

/// Object-safe view of a message, used by codecs and the stream traits.
///
/// Implemented for every `prost::Message + Default`. Custom codecs that
/// serialize some other way can downcast through [`Message::as_any`].
pub trait Message: Send + Sync + 'static {
    fn encode_binary(&self) -> Vec<u8>;

    /// Reset `self` and decode `buf` into it.
    fn decode_binary(&mut self, buf: &[u8]) -> Result<(), prost::DecodeError>;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<M> Message for M
where
    M: prost::Message + Default + Send + Sync + 'static,
{
    fn encode_binary(&self) -> Vec<u8> {
        self.encode_to_vec()
    }

    fn decode_binary(&mut self, buf: &[u8]) -> Result<(), prost::DecodeError> {
        self.clear();
        self.merge(buf)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// A named serializer.
pub trait Codec: Send + Sync + 'static {
    /// Name used in `content-type` (`application/grpc+<name>`).
    fn name(&self) -> &str;

    fn marshal(&self, message: &dyn Message) -> Result<Bytes, Error>;

    fn unmarshal(&self, data: &[u8], message: &mut dyn Message) -> Result<(), Error>;
}

/// Protobuf binary encoding.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProtoBinaryCodec;

impl Codec for ProtoBinaryCodec {
    fn name(&self) -> &str {
        CODEC_NAME_PROTO
    }

    fn marshal(&self, message: &dyn Message) -> Result<Bytes, Error> {
        Ok(Bytes::from(message.encode_binary()))
    }

    fn unmarshal(&self, data: &[u8], message: &mut dyn Message) -> Result<(), Error> {
        message
            .decode_binary(data)
            .map_err(|err| Error::new(Code::InvalidArgument, format!("unmarshal into message: {err}")))
    }
}

/// Read-only codec registry, keyed by name.
#[derive(Clone)]
pub struct Codecs {
    by_name: HashMap<String, Arc<dyn Codec>>,
    names: Vec<String>,
}

impl Codecs {
    pub fn new() -> Self {
        Self {
            by_name: HashMap::new(),
            names: Vec::new(),
        }
    }

    /// Register a codec, replacing any existing codec with the same name.
    /// Codecs with an empty name are ignored.
    pub fn register(&mut self, codec: Arc<dyn Codec>) {
        let name = codec.name().to_string();
        if name.is_empty() {
            return;
        }
        if !self.by_name.contains_key(&name) {
            self.names.push(name.clone());
        }
        self.by_name.insert(name, codec);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Codec>> {
        self.by_name.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// Registered names, in registration order.
    pub fn names(&self) -> &[String] {
        &self.names
    }
}

impl Default for Codecs {
    fn default() -> Self {
        let mut codecs = Self::new();
        codecs.register(Arc::new(ProtoBinaryCodec));
        codecs
    }
}

impl fmt::Debug for Codecs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Codecs").field("names", &self.names).finish()
    }
}
