//! The capability traits every protocol implementation and interceptor
//! works with: one [`Sender`] and one [`Receiver`] per call.

use crate::codec::Message;
use crate::error::Error;
use crate::spec::Specification;
use async_trait::async_trait;
use http::HeaderMap;

/// Outbound half of a call.
///
/// On a client this sends requests; in a handler it sends responses. The
/// header map is flushed with the first message or on close, whichever
/// comes first, so mutations after that point are not transmitted.
#[async_trait]
pub trait Sender: Send {
    fn spec(&self) -> &Specification;

    fn header(&self) -> &HeaderMap;

    fn header_mut(&mut self) -> &mut HeaderMap;

    /// Trailers, on the sides that can send them (handlers).
    fn trailer_mut(&mut self) -> Option<&mut HeaderMap>;

    async fn send(&mut self, message: &dyn Message) -> Result<(), Error>;

    /// Finish the outbound half. Handlers deliver `err` (or OK) to the peer.
    async fn close(&mut self, err: Option<Error>) -> Result<(), Error>;
}

/// Inbound half of a call.
#[async_trait]
pub trait Receiver: Send {
    fn spec(&self) -> &Specification;

    /// Decode the next message into `message`. `Ok(false)` means the peer
    /// finished cleanly.
    async fn receive(&mut self, message: &mut dyn Message) -> Result<bool, Error>;

    async fn close(&mut self) -> Result<(), Error>;

    /// Request headers in a handler; response headers on a client, filled in
    /// once the response has arrived.
    fn header(&self) -> &HeaderMap;

    fn header_mut(&mut self) -> &mut HeaderMap;

    /// Trailers, on the sides that can receive them (clients).
    fn trailer(&self) -> Option<&HeaderMap>;
}

/// Sender that discards everything.
///
/// Stands in when a protocol could not build a real stream but the
/// interceptor chain still has to run.
#[derive(Debug)]
pub struct NopSender {
    spec: Specification,
    header: HeaderMap,
    trailer: HeaderMap,
}

impl NopSender {
    pub fn new(spec: Specification, header: HeaderMap, trailer: HeaderMap) -> Self {
        Self {
            spec,
            header,
            trailer,
        }
    }
}

#[async_trait]
impl Sender for NopSender {
    fn spec(&self) -> &Specification {
        &self.spec
    }

    fn header(&self) -> &HeaderMap {
        &self.header
    }

    fn header_mut(&mut self) -> &mut HeaderMap {
        &mut self.header
    }

    fn trailer_mut(&mut self) -> Option<&mut HeaderMap> {
        Some(&mut self.trailer)
    }

    async fn send(&mut self, _message: &dyn Message) -> Result<(), Error> {
        Ok(())
    }

    async fn close(&mut self, _err: Option<Error>) -> Result<(), Error> {
        Ok(())
    }
}

/// Receiver with no messages.
#[derive(Debug)]
pub struct NopReceiver {
    spec: Specification,
    header: HeaderMap,
    trailer: Option<HeaderMap>,
}

impl NopReceiver {
    pub fn new(spec: Specification, header: HeaderMap, trailer: Option<HeaderMap>) -> Self {
        Self {
            spec,
            header,
            trailer,
        }
    }
}

#[async_trait]
impl Receiver for NopReceiver {
    fn spec(&self) -> &Specification {
        &self.spec
    }

    async fn receive(&mut self, _message: &mut dyn Message) -> Result<bool, Error> {
        Ok(false)
    }

    async fn close(&mut self) -> Result<(), Error> {
        Ok(())
    }

    fn header(&self) -> &HeaderMap {
        &self.header
    }

    fn header_mut(&mut self) -> &mut HeaderMap {
        &mut self.header
    }

    fn trailer(&self) -> Option<&HeaderMap> {
        self.trailer.as_ref()
    }
}
