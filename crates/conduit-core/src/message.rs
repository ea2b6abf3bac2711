//! Typed request and response envelopes for unary calls.

use crate::codec::Message;
use crate::spec::{Specification, StreamType};
use http::HeaderMap;
use std::any::Any;

/// A request message with its headers.
#[derive(Debug, Clone)]
pub struct Request<T> {
    message: T,
    spec: Specification,
    header: HeaderMap,
}

impl<T> Request<T> {
    pub fn new(message: T) -> Self {
        Self {
            message,
            spec: Specification::new("", StreamType::UNARY, true),
            header: HeaderMap::new(),
        }
    }

    pub fn message(&self) -> &T {
        &self.message
    }

    pub fn message_mut(&mut self) -> &mut T {
        &mut self.message
    }

    pub fn into_message(self) -> T {
        self.message
    }

    pub fn spec(&self) -> &Specification {
        &self.spec
    }

    /// Attach the call descriptor. The framework does this before any
    /// interceptor sees the request.
    pub fn with_spec(mut self, spec: Specification) -> Self {
        self.spec = spec;
        self
    }

    pub fn header(&self) -> &HeaderMap {
        &self.header
    }

    pub fn header_mut(&mut self) -> &mut HeaderMap {
        &mut self.header
    }

    pub fn with_header(mut self, header: HeaderMap) -> Self {
        self.header = header;
        self
    }
}

/// A response message with its headers and trailers.
#[derive(Debug, Clone)]
pub struct Response<T> {
    message: T,
    header: HeaderMap,
    trailer: HeaderMap,
}

impl<T> Response<T> {
    pub fn new(message: T) -> Self {
        Self {
            message,
            header: HeaderMap::new(),
            trailer: HeaderMap::new(),
        }
    }

    pub fn message(&self) -> &T {
        &self.message
    }

    pub fn into_message(self) -> T {
        self.message
    }

    pub fn header(&self) -> &HeaderMap {
        &self.header
    }

    pub fn header_mut(&mut self) -> &mut HeaderMap {
        &mut self.header
    }

    pub fn trailer(&self) -> &HeaderMap {
        &self.trailer
    }

    pub fn trailer_mut(&mut self) -> &mut HeaderMap {
        &mut self.trailer
    }

    pub fn into_parts(self) -> (T, HeaderMap, HeaderMap) {
        (self.message, self.header, self.trailer)
    }

    pub fn from_parts(message: T, header: HeaderMap, trailer: HeaderMap) -> Self {
        Self {
            message,
            header,
            trailer,
        }
    }
}

/// Type-erased [`Request`], as seen by unary interceptors.
pub trait AnyRequest: Send + Sync + 'static {
    fn spec(&self) -> &Specification;

    fn header(&self) -> &HeaderMap;

    fn header_mut(&mut self) -> &mut HeaderMap;

    fn message(&self) -> &dyn Message;

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;
}

impl<T: Message> AnyRequest for Request<T> {
    fn spec(&self) -> &Specification {
        &self.spec
    }

    fn header(&self) -> &HeaderMap {
        &self.header
    }

    fn header_mut(&mut self) -> &mut HeaderMap {
        &mut self.header
    }

    fn message(&self) -> &dyn Message {
        &self.message
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

/// Type-erased [`Response`], as seen by unary interceptors.
pub trait AnyResponse: Send + Sync + 'static {
    fn header(&self) -> &HeaderMap;

    fn header_mut(&mut self) -> &mut HeaderMap;

    fn trailer(&self) -> &HeaderMap;

    fn trailer_mut(&mut self) -> &mut HeaderMap;

    fn message(&self) -> &dyn Message;

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;
}

impl<T: Message> AnyResponse for Response<T> {
    fn header(&self) -> &HeaderMap {
        &self.header
    }

    fn header_mut(&mut self) -> &mut HeaderMap {
        &mut self.header
    }

    fn trailer(&self) -> &HeaderMap {
        &self.trailer
    }

    fn trailer_mut(&mut self) -> &mut HeaderMap {
        &mut self.trailer
    }

    fn message(&self) -> &dyn Message {
        &self.message
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

/// Recover the typed request behind a [`AnyRequest`].
pub fn downcast_request<T: Message>(request: Box<dyn AnyRequest>) -> Option<Request<T>> {
    request.into_any().downcast::<Request<T>>().ok().map(|boxed| *boxed)
}

/// Recover the typed response behind a [`AnyResponse`].
pub fn downcast_response<T: Message>(response: Box<dyn AnyResponse>) -> Option<Response<T>> {
    response
        .into_any()
        .downcast::<Response<T>>()
        .ok()
        .map(|boxed| *boxed)
}
