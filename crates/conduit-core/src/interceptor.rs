//! Interceptors and their composition.
//!
//! Given `[A, B, C]`, A is the outermost layer: it sees outbound requests
//! first and inbound responses last. The same holds for unary calls and for
//! every streaming shape, on clients and in handlers:
//!
//! ```text
//! client.send  -> A -> B -> C -> network -> A -> B -> C -> handler.receive
//! client.recv <-  A <- B <- C <- network <- A <- B <- C <- handler.send
//! ```
//!
//! Unary wrappers nest like middleware. For streams, senders act before
//! delegating and receivers act after, so [`Chain`] wraps client halves
//! with A outermost and handler halves with A nearest the network.

use crate::context::CallContext;
use crate::codec::Message;
use crate::error::Error;
use crate::message::{AnyRequest, AnyResponse};
use crate::spec::Specification;
use crate::stream::{Receiver, Sender};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use http::HeaderMap;
use std::future::Future;
use std::sync::Arc;

/// Type-erased unary call: the innermost one performs the RPC (client) or
/// runs the implementation (handler).
pub type UnaryFunc = Arc<
    dyn Fn(CallContext, Box<dyn AnyRequest>) -> BoxFuture<'static, Result<Box<dyn AnyResponse>, Error>>
        + Send
        + Sync,
>;

/// Build a [`UnaryFunc`] from an async closure.
pub fn unary_fn<F, Fut>(f: F) -> UnaryFunc
where
    F: Fn(CallContext, Box<dyn AnyRequest>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Box<dyn AnyResponse>, Error>> + Send + 'static,
{
    Arc::new(move |ctx, request| Box::pin(f(ctx, request)))
}

/// Middleware for unary calls and raw streams.
///
/// Every method defaults to passing its input through unchanged.
pub trait Interceptor: Send + Sync + 'static {
    fn wrap_unary(&self, next: UnaryFunc) -> UnaryFunc {
        next
    }

    /// Adjust the context before a stream is constructed.
    fn wrap_stream_context(&self, ctx: CallContext) -> CallContext {
        ctx
    }

    fn wrap_stream_sender(&self, _ctx: &CallContext, sender: Box<dyn Sender>) -> Box<dyn Sender> {
        sender
    }

    fn wrap_stream_receiver(
        &self,
        _ctx: &CallContext,
        receiver: Box<dyn Receiver>,
    ) -> Box<dyn Receiver> {
        receiver
    }
}

/// An ordered list of interceptors acting as one.
#[derive(Clone, Default)]
pub struct Chain {
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl Chain {
    pub fn new(interceptors: Vec<Arc<dyn Interceptor>>) -> Self {
        Self { interceptors }
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }
}

impl Interceptor for Chain {
    fn wrap_unary(&self, next: UnaryFunc) -> UnaryFunc {
        self.interceptors
            .iter()
            .rev()
            .fold(next, |next, interceptor| interceptor.wrap_unary(next))
    }

    fn wrap_stream_context(&self, ctx: CallContext) -> CallContext {
        self.interceptors
            .iter()
            .fold(ctx, |ctx, interceptor| interceptor.wrap_stream_context(ctx))
    }

    fn wrap_stream_sender(&self, ctx: &CallContext, sender: Box<dyn Sender>) -> Box<dyn Sender> {
        if sender.spec().is_client {
            self.interceptors
                .iter()
                .rev()
                .fold(sender, |sender, interceptor| interceptor.wrap_stream_sender(ctx, sender))
        } else {
            self.interceptors
                .iter()
                .fold(sender, |sender, interceptor| interceptor.wrap_stream_sender(ctx, sender))
        }
    }

    fn wrap_stream_receiver(
        &self,
        ctx: &CallContext,
        receiver: Box<dyn Receiver>,
    ) -> Box<dyn Receiver> {
        if receiver.spec().is_client {
            self.interceptors.iter().rev().fold(receiver, |receiver, interceptor| {
                interceptor.wrap_stream_receiver(ctx, receiver)
            })
        } else {
            self.interceptors.iter().fold(receiver, |receiver, interceptor| {
                interceptor.wrap_stream_receiver(ctx, receiver)
            })
        }
    }
}

type HeaderFn = Arc<dyn Fn(&Specification, &mut HeaderMap) + Send + Sync>;

/// Inspects and mutates request and response headers.
///
/// Request headers are seen before they are sent (client) or once the
/// request has been read (handler); response headers likewise.
#[derive(Clone)]
pub struct HeaderInterceptor {
    inspect_request: HeaderFn,
    inspect_response: HeaderFn,
}

impl HeaderInterceptor {
    pub fn new<Req, Res>(inspect_request: Req, inspect_response: Res) -> Self
    where
        Req: Fn(&Specification, &mut HeaderMap) + Send + Sync + 'static,
        Res: Fn(&Specification, &mut HeaderMap) + Send + Sync + 'static,
    {
        Self {
            inspect_request: Arc::new(inspect_request),
            inspect_response: Arc::new(inspect_response),
        }
    }

    fn outbound(&self, spec: &Specification) -> HeaderFn {
        if spec.is_client {
            self.inspect_request.clone()
        } else {
            self.inspect_response.clone()
        }
    }

    fn inbound(&self, spec: &Specification) -> HeaderFn {
        if spec.is_client {
            self.inspect_response.clone()
        } else {
            self.inspect_request.clone()
        }
    }
}

impl Interceptor for HeaderInterceptor {
    fn wrap_unary(&self, next: UnaryFunc) -> UnaryFunc {
        let inspect_request = self.inspect_request.clone();
        let inspect_response = self.inspect_response.clone();
        unary_fn(move |ctx, mut request| {
            let next = next.clone();
            let inspect_response = inspect_response.clone();
            let spec = request.spec().clone();
            inspect_request(&spec, request.header_mut());
            async move {
                let mut response = next(ctx, request).await?;
                inspect_response(&spec, response.header_mut());
                Ok(response)
            }
        })
    }

    fn wrap_stream_sender(&self, _ctx: &CallContext, sender: Box<dyn Sender>) -> Box<dyn Sender> {
        let inspect = self.outbound(sender.spec());
        Box::new(HeaderInspectingSender {
            inner: sender,
            inspect,
            done: false,
        })
    }

    fn wrap_stream_receiver(
        &self,
        _ctx: &CallContext,
        receiver: Box<dyn Receiver>,
    ) -> Box<dyn Receiver> {
        let inspect = self.inbound(receiver.spec());
        Box::new(HeaderInspectingReceiver {
            inner: receiver,
            inspect,
            done: false,
        })
    }
}

struct HeaderInspectingSender {
    inner: Box<dyn Sender>,
    inspect: HeaderFn,
    done: bool,
}

impl HeaderInspectingSender {
    fn inspect_once(&mut self) {
        if !self.done {
            self.done = true;
            let spec = self.inner.spec().clone();
            (self.inspect)(&spec, self.inner.header_mut());
        }
    }
}

#[async_trait]
impl Sender for HeaderInspectingSender {
    fn spec(&self) -> &Specification {
        self.inner.spec()
    }

    fn header(&self) -> &HeaderMap {
        self.inner.header()
    }

    fn header_mut(&mut self) -> &mut HeaderMap {
        self.inner.header_mut()
    }

    fn trailer_mut(&mut self) -> Option<&mut HeaderMap> {
        self.inner.trailer_mut()
    }

    async fn send(&mut self, message: &dyn Message) -> Result<(), Error> {
        self.inspect_once();
        self.inner.send(message).await
    }

    async fn close(&mut self, err: Option<Error>) -> Result<(), Error> {
        self.inspect_once();
        self.inner.close(err).await
    }
}

struct HeaderInspectingReceiver {
    inner: Box<dyn Receiver>,
    inspect: HeaderFn,
    done: bool,
}

#[async_trait]
impl Receiver for HeaderInspectingReceiver {
    fn spec(&self) -> &Specification {
        self.inner.spec()
    }

    async fn receive(&mut self, message: &mut dyn Message) -> Result<bool, Error> {
        let result = self.inner.receive(message).await;
        if !self.done {
            self.done = true;
            let spec = self.inner.spec().clone();
            (self.inspect)(&spec, self.inner.header_mut());
        }
        result
    }

    async fn close(&mut self) -> Result<(), Error> {
        self.inner.close().await
    }

    fn header(&self) -> &HeaderMap {
        self.inner.header()
    }

    fn header_mut(&mut self) -> &mut HeaderMap {
        self.inner.header_mut()
    }

    fn trailer(&self) -> Option<&HeaderMap> {
        self.inner.trailer()
    }
}

type ErrorFn = Arc<dyn Fn(Error) -> Error + Send + Sync>;

/// Rewrites errors crossing this layer in either direction.
#[derive(Clone)]
pub struct ErrorTranslator {
    map: ErrorFn,
}

impl ErrorTranslator {
    pub fn new<F>(map: F) -> Self
    where
        F: Fn(Error) -> Error + Send + Sync + 'static,
    {
        Self { map: Arc::new(map) }
    }
}

impl Interceptor for ErrorTranslator {
    fn wrap_unary(&self, next: UnaryFunc) -> UnaryFunc {
        let map = self.map.clone();
        unary_fn(move |ctx, request| {
            let next = next.clone();
            let map = map.clone();
            async move { next(ctx, request).await.map_err(|err| map(err)) }
        })
    }

    fn wrap_stream_sender(&self, _ctx: &CallContext, sender: Box<dyn Sender>) -> Box<dyn Sender> {
        Box::new(ErrorMappingSender {
            inner: sender,
            map: self.map.clone(),
        })
    }

    fn wrap_stream_receiver(
        &self,
        _ctx: &CallContext,
        receiver: Box<dyn Receiver>,
    ) -> Box<dyn Receiver> {
        Box::new(ErrorMappingReceiver {
            inner: receiver,
            map: self.map.clone(),
        })
    }
}

struct ErrorMappingSender {
    inner: Box<dyn Sender>,
    map: ErrorFn,
}

#[async_trait]
impl Sender for ErrorMappingSender {
    fn spec(&self) -> &Specification {
        self.inner.spec()
    }

    fn header(&self) -> &HeaderMap {
        self.inner.header()
    }

    fn header_mut(&mut self) -> &mut HeaderMap {
        self.inner.header_mut()
    }

    fn trailer_mut(&mut self) -> Option<&mut HeaderMap> {
        self.inner.trailer_mut()
    }

    async fn send(&mut self, message: &dyn Message) -> Result<(), Error> {
        let map = &self.map;
        self.inner.send(message).await.map_err(|err| map(err))
    }

    async fn close(&mut self, err: Option<Error>) -> Result<(), Error> {
        let map = &self.map;
        self.inner
            .close(err.map(|err| map(err)))
            .await
            .map_err(|err| map(err))
    }
}

struct ErrorMappingReceiver {
    inner: Box<dyn Receiver>,
    map: ErrorFn,
}

#[async_trait]
impl Receiver for ErrorMappingReceiver {
    fn spec(&self) -> &Specification {
        self.inner.spec()
    }

    async fn receive(&mut self, message: &mut dyn Message) -> Result<bool, Error> {
        let map = &self.map;
        self.inner.receive(message).await.map_err(|err| map(err))
    }

    async fn close(&mut self) -> Result<(), Error> {
        let map = &self.map;
        self.inner.close().await.map_err(|err| map(err))
    }

    fn header(&self) -> &HeaderMap {
        self.inner.header()
    }

    fn header_mut(&mut self) -> &mut HeaderMap {
        self.inner.header_mut()
    }

    fn trailer(&self) -> Option<&HeaderMap> {
        self.inner.trailer()
    }
}
