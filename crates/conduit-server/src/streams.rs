//! Typed stream handles passed to handler implementations.

use conduit_core::{Error, Message, Receiver, Sender, Specification};
use http::HeaderMap;
use std::marker::PhantomData;

async fn receive_next<Req>(receiver: &mut dyn Receiver) -> Result<Option<Req>, Error>
where
    Req: Message + Default,
{
    let mut message = Req::default();
    if receiver.receive(&mut message).await? {
        Ok(Some(message))
    } else {
        Ok(None)
    }
}

/// Trailer map of `sender`, or `fallback` on senders that have none.
fn trailer_or<'a>(sender: &'a mut dyn Sender, fallback: &'a mut HeaderMap) -> &'a mut HeaderMap {
    match sender.trailer_mut() {
        Some(trailer) => trailer,
        None => fallback,
    }
}

/// Inbound side of a client-streaming call.
pub struct ClientStream<Req> {
    receiver: Box<dyn Receiver>,
    _marker: PhantomData<fn() -> Req>,
}

impl<Req> ClientStream<Req>
where
    Req: Message + Default,
{
    pub(crate) fn new(receiver: Box<dyn Receiver>) -> Self {
        Self {
            receiver,
            _marker: PhantomData,
        }
    }

    pub(crate) fn into_receiver(self) -> Box<dyn Receiver> {
        self.receiver
    }

    pub fn spec(&self) -> &Specification {
        self.receiver.spec()
    }

    pub fn request_header(&self) -> &HeaderMap {
        self.receiver.header()
    }

    /// Next request, or `None` once the client has finished sending.
    pub async fn receive(&mut self) -> Result<Option<Req>, Error> {
        receive_next(self.receiver.as_mut()).await
    }
}

/// Outbound side of a server-streaming call.
pub struct ServerStream<Res> {
    sender: Box<dyn Sender>,
    trailer_fallback: HeaderMap,
    _marker: PhantomData<fn(Res)>,
}

impl<Res> ServerStream<Res>
where
    Res: Message,
{
    pub(crate) fn new(sender: Box<dyn Sender>) -> Self {
        Self {
            sender,
            trailer_fallback: HeaderMap::new(),
            _marker: PhantomData,
        }
    }

    pub(crate) fn into_sender(self) -> Box<dyn Sender> {
        self.sender
    }

    /// Response headers. They are sent with the first message, so later
    /// changes are lost.
    pub fn response_header_mut(&mut self) -> &mut HeaderMap {
        self.sender.header_mut()
    }

    pub fn response_trailer_mut(&mut self) -> &mut HeaderMap {
        trailer_or(self.sender.as_mut(), &mut self.trailer_fallback)
    }

    pub async fn send(&mut self, message: &Res) -> Result<(), Error> {
        self.sender.send(message).await
    }
}

/// Both sides of a bidirectional call.
pub struct BidiStream<Req, Res> {
    sender: Box<dyn Sender>,
    receiver: Box<dyn Receiver>,
    trailer_fallback: HeaderMap,
    _marker: PhantomData<fn(Req) -> Res>,
}

impl<Req, Res> BidiStream<Req, Res>
where
    Req: Message + Default,
    Res: Message,
{
    pub(crate) fn new(sender: Box<dyn Sender>, receiver: Box<dyn Receiver>) -> Self {
        Self {
            sender,
            receiver,
            trailer_fallback: HeaderMap::new(),
            _marker: PhantomData,
        }
    }

    pub(crate) fn into_parts(self) -> (Box<dyn Sender>, Box<dyn Receiver>) {
        (self.sender, self.receiver)
    }

    pub fn spec(&self) -> &Specification {
        self.receiver.spec()
    }

    pub fn request_header(&self) -> &HeaderMap {
        self.receiver.header()
    }

    pub async fn receive(&mut self) -> Result<Option<Req>, Error> {
        receive_next(self.receiver.as_mut()).await
    }

    pub fn response_header_mut(&mut self) -> &mut HeaderMap {
        self.sender.header_mut()
    }

    pub fn response_trailer_mut(&mut self) -> &mut HeaderMap {
        trailer_or(self.sender.as_mut(), &mut self.trailer_fallback)
    }

    pub async fn send(&mut self, message: &Res) -> Result<(), Error> {
        self.sender.send(message).await
    }
}
