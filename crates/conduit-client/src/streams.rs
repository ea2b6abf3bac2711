//! Typed handles for streaming calls.

use conduit_core::{Code, Error, Message, Receiver, Response, Sender};
use http::HeaderMap;
use std::marker::PhantomData;
use std::sync::OnceLock;

/// Receive exactly one message, then the end of the stream.
///
/// A second message, or none at all, is an Unknown error. Closes the
/// receiver in every case.
pub(crate) async fn receive_unary<Res>(receiver: &mut dyn Receiver) -> Result<Response<Res>, Error>
where
    Res: Message + Default,
{
    let result = receive_exactly_one::<Res>(receiver).await;
    let closed = receiver.close().await;
    let message = result?;
    closed?;
    Ok(Response::from_parts(
        message,
        receiver.header().clone(),
        receiver.trailer().cloned().unwrap_or_default(),
    ))
}

async fn receive_exactly_one<Res>(receiver: &mut dyn Receiver) -> Result<Res, Error>
where
    Res: Message + Default,
{
    let mut message = Res::default();
    if !receiver.receive(&mut message).await? {
        return Err(Error::new(Code::Unknown, "unary stream has no messages"));
    }
    let mut extra = Res::default();
    if receiver.receive(&mut extra).await? {
        return Err(Error::new(Code::Unknown, "unary stream has multiple messages"));
    }
    Ok(message)
}

async fn receive_next<Res>(receiver: &mut dyn Receiver) -> Result<Option<Res>, Error>
where
    Res: Message + Default,
{
    let mut message = Res::default();
    if receiver.receive(&mut message).await? {
        Ok(Some(message))
    } else {
        Ok(None)
    }
}

/// Send failures caused by the server hanging up carry no information of
/// their own; the real outcome comes from the receive side.
fn ignore_end_of_stream(result: Result<(), Error>) -> Result<(), Error> {
    match result {
        Err(err) if err.is_end_of_stream() => Ok(()),
        other => other,
    }
}

/// Client-streaming call: many requests, one response.
pub struct ClientStreamCall<Req, Res> {
    sender: Box<dyn Sender>,
    receiver: Box<dyn Receiver>,
    _marker: PhantomData<fn(Req) -> Res>,
}

impl<Req, Res> ClientStreamCall<Req, Res>
where
    Req: Message,
    Res: Message + Default,
{
    pub(crate) fn new(sender: Box<dyn Sender>, receiver: Box<dyn Receiver>) -> Self {
        Self {
            sender,
            receiver,
            _marker: PhantomData,
        }
    }

    /// Request headers. Changes after the first send are not transmitted.
    pub fn request_header_mut(&mut self) -> &mut HeaderMap {
        self.sender.header_mut()
    }

    /// Send one request. An end-of-stream error means the server stopped
    /// reading; call [`close_and_receive`](Self::close_and_receive) for
    /// the outcome.
    pub async fn send(&mut self, message: &Req) -> Result<(), Error> {
        self.sender.send(message).await
    }

    pub async fn close_and_receive(mut self) -> Result<Response<Res>, Error> {
        if let Err(err) = self.sender.close(None).await {
            let _ = self.receiver.close().await;
            return Err(err);
        }
        receive_unary(self.receiver.as_mut()).await
    }
}

/// Server-streaming call: one request, many responses.
pub struct ServerStreamCall<Res> {
    receiver: Box<dyn Receiver>,
    _marker: PhantomData<fn() -> Res>,
}

impl<Res> ServerStreamCall<Res>
where
    Res: Message + Default,
{
    pub(crate) fn new(receiver: Box<dyn Receiver>) -> Self {
        Self {
            receiver,
            _marker: PhantomData,
        }
    }

    /// Next response, or `None` once the server finished successfully.
    pub async fn receive(&mut self) -> Result<Option<Res>, Error> {
        receive_next(self.receiver.as_mut()).await
    }

    /// Response headers, available after the first receive.
    pub fn response_header(&self) -> &HeaderMap {
        self.receiver.header()
    }

    /// Response trailers, complete once `receive` has returned `None`.
    pub fn response_trailer(&self) -> &HeaderMap {
        self.receiver.trailer().unwrap_or_else(|| empty_header())
    }

    pub async fn close(mut self) -> Result<(), Error> {
        self.receiver.close().await
    }
}

/// Bidirectional call.
///
/// The request starts with the first send or `close_send`, so receiving
/// before either waits for one of them.
pub struct BidiStreamCall<Req, Res> {
    sender: Box<dyn Sender>,
    receiver: Box<dyn Receiver>,
    _marker: PhantomData<fn(Req) -> Res>,
}

impl<Req, Res> BidiStreamCall<Req, Res>
where
    Req: Message,
    Res: Message + Default,
{
    pub(crate) fn new(sender: Box<dyn Sender>, receiver: Box<dyn Receiver>) -> Self {
        Self {
            sender,
            receiver,
            _marker: PhantomData,
        }
    }

    pub fn request_header_mut(&mut self) -> &mut HeaderMap {
        self.sender.header_mut()
    }

    pub async fn send(&mut self, message: &Req) -> Result<(), Error> {
        self.sender.send(message).await
    }

    pub async fn close_send(&mut self) -> Result<(), Error> {
        self.sender.close(None).await
    }

    pub async fn receive(&mut self) -> Result<Option<Res>, Error> {
        receive_next(self.receiver.as_mut()).await
    }

    pub fn response_header(&self) -> &HeaderMap {
        self.receiver.header()
    }

    pub fn response_trailer(&self) -> &HeaderMap {
        self.receiver.trailer().unwrap_or_else(|| empty_header())
    }

    pub async fn close_receive(&mut self) -> Result<(), Error> {
        self.receiver.close().await
    }
}

fn empty_header() -> &'static HeaderMap {
    static EMPTY: OnceLock<HeaderMap> = OnceLock::new();
    EMPTY.get_or_init(HeaderMap::new)
}

/// Send `message` and close, for calls with a single request.
pub(crate) async fn send_single(sender: &mut dyn Sender, message: &dyn Message) -> Result<(), Error> {
    ignore_end_of_stream(sender.send(message).await)?;
    sender.close(None).await
}
