//! Serving one procedure.
//!
//! A [`Handler`] checks the transport-level shape of a request (method,
//! content type, HTTP version), builds the protocol stream, applies the
//! interceptor chain and runs the implementation on its own task while the
//! HTTP response streams back.

use crate::protocol::HandlerProtocol;
use crate::registrar::Registrar;
use crate::streams::{BidiStream, ClientStream, ServerStream};
use bytes::Bytes;
use conduit_core::header::merge_headers;
use conduit_core::message::downcast_request;
use conduit_core::protocol::{ACCEPT_POST, GRPC_TIMEOUT};
use conduit_core::timeout::decode_timeout;
use conduit_core::{
    unary_fn, AnyRequest, AnyResponse, Body, CallContext, Chain, Code, Codec, Codecs, Compression,
    Compressors, Error, GzipCompression, Interceptor, Message, Protocol, Receiver, Request,
    Response, Sender, Specification, StreamType, ZstdCompression, COMPRESSION_GZIP,
    COMPRESSION_ZSTD, DEFAULT_COMPRESS_MIN_BYTES, DEFAULT_READ_MAX_BYTES,
};
use futures_util::future::{BoxFuture, FutureExt};
use http::header::CONTENT_TYPE;
use http::{HeaderValue, Method, StatusCode, Version};
use http_body_util::{BodyExt, Empty};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

/// Runs a call once its halves exist. The error, if any, is a protocol
/// failure the implementation must report instead of doing work.
type Implementation = Arc<
    dyn Fn(CallContext, Box<dyn Sender>, Box<dyn Receiver>, Option<Error>) -> BoxFuture<'static, ()>
        + Send
        + Sync,
>;

struct HandlerInner {
    spec: Specification,
    /// Applied to streams. Unary handlers apply theirs around the typed call.
    interceptor: Chain,
    implementation: Implementation,
    protocols: Vec<HandlerProtocol>,
}

/// Server side of one procedure. Cheap to clone.
#[derive(Clone)]
pub struct Handler {
    inner: Arc<HandlerInner>,
}

impl Handler {
    pub fn builder(procedure: impl Into<String>) -> HandlerBuilder {
        HandlerBuilder::new(procedure)
    }

    /// `package.Service/Method` this handler serves.
    pub fn procedure(&self) -> &str {
        &self.inner.spec.procedure
    }

    pub fn spec(&self) -> &Specification {
        &self.inner.spec
    }

    /// Serve one HTTP request.
    pub fn handle(&self, request: http::Request<Body>) -> BoxFuture<'static, http::Response<Body>> {
        let inner = self.inner.clone();
        async move { inner.serve(request).await }.boxed()
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler")
            .field("procedure", &self.inner.spec.procedure)
            .field("stream_type", &self.inner.spec.stream_type)
            .field("interceptors", &self.inner.interceptor.len())
            .finish()
    }
}

impl HandlerInner {
    async fn serve(&self, request: http::Request<Body>) -> http::Response<Body> {
        if self.spec.stream_type.is_bidi() && request.version() < Version::HTTP_2 {
            return self.fail_negotiation(StatusCode::HTTP_VERSION_NOT_SUPPORTED);
        }
        if request.method() != Method::POST {
            return self.fail_negotiation(StatusCode::METHOD_NOT_ALLOWED);
        }
        let content_type = request
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        let Some((protocol, codec)) = self
            .protocols
            .iter()
            .find_map(|protocol| protocol.codec_for(content_type).map(|codec| (protocol, codec)))
        else {
            return self.fail_negotiation(StatusCode::UNSUPPORTED_MEDIA_TYPE);
        };

        let (parts, body) = request.into_parts();
        let timeout = parts
            .headers
            .get(GRPC_TIMEOUT)
            .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned());
        let mut ctx = CallContext::new();
        let error = match decode_timeout(timeout.as_deref()) {
            Ok(Some(timeout)) => {
                ctx = ctx.with_timeout(timeout);
                None
            }
            Ok(None) => None,
            Err(err) => Some(Error::from(err)),
        };
        let ctx = self.interceptor.wrap_stream_context(ctx);

        let stream = protocol.new_stream(
            self.spec.clone(),
            ctx.clone(),
            codec,
            parts.headers,
            body,
            error,
        );
        let sender = self.interceptor.wrap_stream_sender(&ctx, stream.sender);
        let receiver = self.interceptor.wrap_stream_receiver(&ctx, stream.receiver);
        tokio::spawn((self.implementation)(ctx.clone(), sender, receiver, stream.error));
        stream.response.into_response(ctx).await
    }

    /// Reject a request no protocol can serve, advertising what would work.
    fn fail_negotiation(&self, status: StatusCode) -> http::Response<Body> {
        debug!(procedure = %self.spec.procedure, status = %status, "request rejected");
        let accepted = self
            .protocols
            .iter()
            .flat_map(HandlerProtocol::accepted_content_types)
            .collect::<Vec<_>>()
            .join(", ");
        let mut response = http::Response::new(
            Empty::<Bytes>::new()
                .map_err(|never| match never {})
                .boxed_unsync(),
        );
        *response.status_mut() = status;
        if let Ok(value) = HeaderValue::from_str(&accepted) {
            response.headers_mut().insert(ACCEPT_POST, value);
        }
        response
    }
}

fn warn_if_error(spec: &Specification, result: Result<(), Error>) {
    if let Err(err) = result {
        warn!(
            procedure = %spec.procedure,
            code = %err.code(),
            "failed to deliver call outcome: {}",
            err.message()
        );
    }
}

/// Receive exactly one request message.
async fn receive_unary_request<Req>(receiver: &mut dyn Receiver) -> Result<Request<Req>, Error>
where
    Req: Message + Default,
{
    let mut message = Req::default();
    if !receiver.receive(&mut message).await? {
        return Err(Error::new(Code::Unknown, "unary request has no messages"));
    }
    let mut extra = Req::default();
    if receiver.receive(&mut extra).await? {
        return Err(Error::new(Code::Unknown, "unary request has multiple messages"));
    }
    Ok(Request::new(message)
        .with_spec(receiver.spec().clone())
        .with_header(receiver.header().clone()))
}

/// A placeholder request carrying only metadata, so interceptors still see
/// calls whose message could not be read.
fn metadata_request<Req>(receiver: &dyn Receiver) -> Request<Req>
where
    Req: Message + Default,
{
    Request::new(Req::default())
        .with_spec(receiver.spec().clone())
        .with_header(receiver.header().clone())
}

async fn send_response<Res>(sender: &mut dyn Sender, response: Response<Res>) -> Result<(), Error>
where
    Res: Message,
{
    let (message, header, trailer) = response.into_parts();
    merge_headers(sender.header_mut(), &header);
    if let Some(sender_trailer) = sender.trailer_mut() {
        merge_headers(sender_trailer, &trailer);
    }
    sender.send(&message).await
}

/// Configures and builds a [`Handler`].
///
/// Defaults: protobuf codec, gzip, both gRPC and gRPC-Web.
pub struct HandlerBuilder {
    procedure: String,
    codecs: Codecs,
    compressors: Compressors,
    compress_min_bytes: usize,
    read_max_bytes: usize,
    interceptors: Vec<Arc<dyn Interceptor>>,
    prefix_rewrite: Option<(String, String)>,
    registrar: Option<Arc<Registrar>>,
    grpc: bool,
    grpc_web: bool,
}

impl HandlerBuilder {
    pub fn new(procedure: impl Into<String>) -> Self {
        let mut compressors = Compressors::new();
        compressors.register(COMPRESSION_GZIP, Arc::new(GzipCompression));
        Self {
            procedure: procedure.into(),
            codecs: Codecs::default(),
            compressors,
            compress_min_bytes: DEFAULT_COMPRESS_MIN_BYTES,
            read_max_bytes: DEFAULT_READ_MAX_BYTES,
            interceptors: Vec::new(),
            prefix_rewrite: None,
            registrar: None,
            grpc: true,
            grpc_web: true,
        }
    }

    /// Accept another codec, replacing any with the same name.
    pub fn codec(mut self, codec: impl Codec) -> Self {
        self.codecs.register(Arc::new(codec));
        self
    }

    pub fn compression(mut self, name: impl Into<String>, compression: impl Compression) -> Self {
        self.compressors.register(name, Arc::new(compression));
        self
    }

    pub fn gzip(self) -> Self {
        self.compression(COMPRESSION_GZIP, GzipCompression)
    }

    pub fn zstd(self) -> Self {
        self.compression(COMPRESSION_ZSTD, ZstdCompression::default())
    }

    /// Responses smaller than this are sent uncompressed.
    pub fn compress_min_bytes(mut self, bytes: usize) -> Self {
        self.compress_min_bytes = bytes;
        self
    }

    /// Largest request message accepted, after decompression. 0 is unlimited.
    pub fn read_max_bytes(mut self, bytes: usize) -> Self {
        self.read_max_bytes = bytes;
        self
    }

    pub fn interceptor(mut self, interceptor: impl Interceptor) -> Self {
        self.interceptors.push(Arc::new(interceptor));
        self
    }

    /// Append interceptors. The first one is outermost.
    pub fn interceptors(mut self, interceptors: impl IntoIterator<Item = Arc<dyn Interceptor>>) -> Self {
        self.interceptors.extend(interceptors);
        self
    }

    /// Serve `replacement...` instead of `prefix...`.
    pub fn replace_procedure_prefix(
        mut self,
        prefix: impl Into<String>,
        replacement: impl Into<String>,
    ) -> Self {
        self.prefix_rewrite = Some((prefix.into(), replacement.into()));
        self
    }

    /// Record this handler's service name in `registrar`.
    pub fn registrar(mut self, registrar: Arc<Registrar>) -> Self {
        self.registrar = Some(registrar);
        self
    }

    pub fn grpc(mut self, enabled: bool) -> Self {
        self.grpc = enabled;
        self
    }

    pub fn grpc_web(mut self, enabled: bool) -> Self {
        self.grpc_web = enabled;
        self
    }

    /// Request-response procedure.
    pub fn unary<Req, Res, F, Fut>(self, implementation: F) -> Handler
    where
        Req: Message + Default,
        Res: Message,
        F: Fn(CallContext, Request<Req>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Response<Res>, Error>> + Send + 'static,
    {
        let chain = Chain::new(self.interceptors.clone());
        let implementation = Arc::new(implementation);
        let run: Implementation = Arc::new(
            move |ctx: CallContext,
                  mut sender: Box<dyn Sender>,
                  mut receiver: Box<dyn Receiver>,
                  error: Option<Error>| {
                let chain = chain.clone();
                let implementation = implementation.clone();
                async move {
                    let spec = sender.spec().clone();
                    let (request, error) = match error {
                        Some(err) => (metadata_request::<Req>(&*receiver), Some(err)),
                        None => match receive_unary_request::<Req>(receiver.as_mut()).await {
                            Ok(request) => (request, None),
                            Err(err) => (metadata_request::<Req>(&*receiver), Some(err)),
                        },
                    };
                    warn_if_error(&spec, receiver.close().await);

                    let call = unary_fn(move |ctx: CallContext, request| {
                        let implementation = implementation.clone();
                        let error = error.clone();
                        async move {
                            if let Some(err) = error {
                                return Err(err);
                            }
                            if let Some(err) = ctx.err() {
                                return Err(err);
                            }
                            let request = downcast_request::<Req>(request).ok_or_else(|| {
                                Error::new(
                                    Code::Internal,
                                    "interceptor returned a request of the wrong type",
                                )
                            })?;
                            let response = implementation(ctx, request).await?;
                            Ok(Box::new(response) as Box<dyn AnyResponse>)
                        }
                    });
                    match chain.wrap_unary(call)(ctx, Box::new(request) as Box<dyn AnyRequest>).await {
                        Ok(response) => {
                            merge_headers(sender.header_mut(), response.header());
                            if let Some(trailer) = sender.trailer_mut() {
                                merge_headers(trailer, response.trailer());
                            }
                            let sent = sender.send(response.message()).await;
                            warn_if_error(&spec, sender.close(sent.err()).await);
                        }
                        Err(err) => warn_if_error(&spec, sender.close(Some(err)).await),
                    }
                }
                .boxed()
            },
        );
        self.finish(StreamType::UNARY, run, Chain::default())
    }

    /// Many requests, one response.
    pub fn client_stream<Req, Res, F>(self, implementation: F) -> Handler
    where
        Req: Message + Default,
        Res: Message,
        F: for<'a> Fn(CallContext, &'a mut ClientStream<Req>) -> BoxFuture<'a, Result<Response<Res>, Error>>
            + Send
            + Sync
            + 'static,
    {
        let implementation = Arc::new(implementation);
        self.stream_handler(StreamType::CLIENT, move |ctx, mut sender, receiver| {
            let implementation = implementation.clone();
            async move {
                let spec = sender.spec().clone();
                let mut stream = ClientStream::new(receiver);
                let result = implementation(ctx, &mut stream).await;
                warn_if_error(&spec, stream.into_receiver().close().await);
                let err = match result {
                    Ok(response) => send_response(sender.as_mut(), response).await.err(),
                    Err(err) => Some(err),
                };
                warn_if_error(&spec, sender.close(err).await);
            }
            .boxed()
        })
    }

    /// One request, many responses.
    pub fn server_stream<Req, Res, F>(self, implementation: F) -> Handler
    where
        Req: Message + Default,
        Res: Message,
        F: for<'a> Fn(CallContext, Request<Req>, &'a mut ServerStream<Res>) -> BoxFuture<'a, Result<(), Error>>
            + Send
            + Sync
            + 'static,
    {
        let implementation = Arc::new(implementation);
        self.stream_handler(StreamType::SERVER, move |ctx, mut sender, mut receiver| {
            let implementation = implementation.clone();
            async move {
                let spec = sender.spec().clone();
                let request = receive_unary_request::<Req>(receiver.as_mut()).await;
                let closed = receiver.close().await;
                let request = match (request, closed) {
                    (Ok(request), Ok(())) => request,
                    (Err(err), _) | (Ok(_), Err(err)) => {
                        warn_if_error(&spec, sender.close(Some(err)).await);
                        return;
                    }
                };
                let mut stream = ServerStream::new(sender);
                let result = implementation(ctx, request, &mut stream).await;
                let mut sender = stream.into_sender();
                warn_if_error(&spec, sender.close(result.err()).await);
            }
            .boxed()
        })
    }

    /// Both sides stream. Served over HTTP/2 only.
    pub fn bidi_stream<Req, Res, F>(self, implementation: F) -> Handler
    where
        Req: Message + Default,
        Res: Message,
        F: for<'a> Fn(CallContext, &'a mut BidiStream<Req, Res>) -> BoxFuture<'a, Result<(), Error>>
            + Send
            + Sync
            + 'static,
    {
        let implementation = Arc::new(implementation);
        self.stream_handler(StreamType::BIDI, move |ctx, sender, receiver| {
            let implementation = implementation.clone();
            async move {
                let spec = sender.spec().clone();
                let mut stream = BidiStream::new(sender, receiver);
                let result = implementation(ctx.clone(), &mut stream).await;
                let (mut sender, mut receiver) = stream.into_parts();
                warn_if_error(&spec, receiver.close().await);
                let closed = sender.close(result.err()).await;
                // A canceled or expired call has no one left to tell.
                if ctx.err().is_none() {
                    warn_if_error(&spec, closed);
                }
            }
            .boxed()
        })
    }

    /// Wrap a streaming implementation so protocol failures are reported
    /// without running it.
    fn stream_handler<F>(self, stream_type: StreamType, run: F) -> Handler
    where
        F: Fn(CallContext, Box<dyn Sender>, Box<dyn Receiver>) -> BoxFuture<'static, ()>
            + Send
            + Sync
            + 'static,
    {
        let implementation: Implementation = Arc::new(
            move |ctx: CallContext,
                  mut sender: Box<dyn Sender>,
                  mut receiver: Box<dyn Receiver>,
                  error: Option<Error>| match error {
                Some(err) => async move {
                    let spec = sender.spec().clone();
                    warn_if_error(&spec, receiver.close().await);
                    warn_if_error(&spec, sender.close(Some(err)).await);
                }
                .boxed(),
                None => run(ctx, sender, receiver),
            },
        );
        let chain = Chain::new(self.interceptors.clone());
        self.finish(stream_type, implementation, chain)
    }

    fn finish(self, stream_type: StreamType, implementation: Implementation, interceptor: Chain) -> Handler {
        let mut procedure = self.procedure.trim_start_matches('/').to_string();
        let mut rewritten = false;
        if let Some((prefix, replacement)) = &self.prefix_rewrite {
            if let Some(rest) = procedure.strip_prefix(prefix.as_str()) {
                procedure = format!("{replacement}{rest}");
                rewritten = true;
            }
        }
        let spec = Specification::new(procedure, stream_type, false);
        if let (Some(registrar), false) = (&self.registrar, rewritten) {
            registrar.register(spec.service());
        }

        let codecs = Arc::new(self.codecs);
        let compressors = Arc::new(self.compressors);
        let protocols = [(Protocol::Grpc, self.grpc), (Protocol::GrpcWeb, self.grpc_web)]
            .into_iter()
            .filter(|(_, enabled)| *enabled)
            .map(|(protocol, _)| HandlerProtocol {
                protocol,
                codecs: codecs.clone(),
                compressors: compressors.clone(),
                compress_min_bytes: self.compress_min_bytes,
                read_max_bytes: self.read_max_bytes,
            })
            .collect();

        Handler {
            inner: Arc::new(HandlerInner {
                spec,
                interceptor,
                implementation,
                protocols,
            }),
        }
    }
}

impl fmt::Debug for HandlerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerBuilder")
            .field("procedure", &self.procedure)
            .field("codecs", &self.codecs)
            .field("compressors", &self.compressors)
            .field("grpc", &self.grpc)
            .field("grpc_web", &self.grpc_web)
            .field("interceptors", &self.interceptors.len())
            .finish()
    }
}
