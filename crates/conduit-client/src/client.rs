//! Typed client for one procedure.

use crate::protocol::ClientProtocol;
use crate::streams::{receive_unary, send_single, BidiStreamCall, ClientStreamCall, ServerStreamCall};
use crate::transport::{ClientConfig, HttpClient, HttpProtocol, HyperClient};
use conduit_core::compression::COMPRESSION_IDENTITY;
use conduit_core::header::merge_headers;
use conduit_core::message::downcast_response;
use conduit_core::{
    unary_fn, AnyRequest, AnyResponse, CallContext, Chain, Code, Codec, Compression, Compressors,
    Error, GzipCompression, Interceptor, Message, ProtoBinaryCodec, Protocol, Receiver, Request,
    Response, Sender, Specification, StreamType, ZstdCompression, COMPRESSION_GZIP,
    COMPRESSION_ZSTD, DEFAULT_COMPRESS_MIN_BYTES, DEFAULT_READ_MAX_BYTES,
};
use http::Uri;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::instrument;

struct ClientInner {
    procedure: String,
    uri: Uri,
    protocol: ClientProtocol,
    http: Arc<dyn HttpClient>,
    interceptor: Chain,
}

impl ClientInner {
    fn spec(&self, stream_type: StreamType) -> Specification {
        Specification::new(self.procedure.clone(), stream_type, true)
    }

    fn open(&self, ctx: CallContext, spec: Specification) -> (Box<dyn Sender>, Box<dyn Receiver>) {
        self.protocol
            .new_stream(ctx, spec, self.http.clone(), self.uri.clone())
    }

    /// Open a stream with every interceptor applied.
    fn new_stream(
        &self,
        ctx: CallContext,
        stream_type: StreamType,
    ) -> (Box<dyn Sender>, Box<dyn Receiver>) {
        let ctx = self.interceptor.wrap_stream_context(ctx);
        let (sender, receiver) = self.open(ctx.clone(), self.spec(stream_type));
        let sender = self.interceptor.wrap_stream_sender(&ctx, sender);
        let receiver = self.interceptor.wrap_stream_receiver(&ctx, receiver);
        (sender, receiver)
    }
}

/// Calls one procedure over gRPC or gRPC-Web.
///
/// Cheap to clone; clones share the connection pool.
pub struct Client<Req, Res> {
    inner: Arc<ClientInner>,
    _marker: PhantomData<fn(Req) -> Res>,
}

impl<Req, Res> Clone for Client<Req, Res> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            _marker: PhantomData,
        }
    }
}

impl<Req, Res> fmt::Debug for Client<Req, Res> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("procedure", &self.inner.procedure)
            .field("uri", &self.inner.uri)
            .field("protocol", &self.inner.protocol.protocol)
            .finish()
    }
}

impl<Req, Res> Client<Req, Res>
where
    Req: Message,
    Res: Message + Default,
{
    pub fn builder(base_url: impl Into<String>, procedure: impl Into<String>) -> ClientBuilder {
        ClientBuilder::new(base_url, procedure)
    }

    /// `package.Service/Method` this client calls.
    pub fn procedure(&self) -> &str {
        &self.inner.procedure
    }

    fn service(&self) -> &str {
        self.inner
            .procedure
            .rsplit_once('/')
            .map_or("", |(service, _)| service)
    }

    fn method(&self) -> &str {
        self.inner
            .procedure
            .rsplit_once('/')
            .map_or(self.inner.procedure.as_str(), |(_, method)| method)
    }

    /// Make a unary call.
    #[instrument(
        skip_all,
        fields(
            rpc.system = "grpc",
            rpc.service = self.service(),
            rpc.method = self.method(),
            otel.kind = "client"
        )
    )]
    pub async fn call_unary(
        &self,
        ctx: CallContext,
        request: Request<Req>,
    ) -> Result<Response<Res>, Error> {
        let spec = self.inner.spec(StreamType::UNARY);
        let request = request.with_spec(spec.clone());
        let inner = self.inner.clone();
        let call = unary_fn(move |ctx, request: Box<dyn AnyRequest>| {
            let inner = inner.clone();
            let spec = spec.clone();
            async move {
                let (mut sender, mut receiver) = inner.open(ctx, spec);
                merge_headers(sender.header_mut(), request.header());
                if let Err(err) = send_single(sender.as_mut(), request.message()).await {
                    let _ = receiver.close().await;
                    return Err(err);
                }
                let response = receive_unary::<Res>(receiver.as_mut()).await?;
                Ok(Box::new(response) as Box<dyn AnyResponse>)
            }
        });
        let response = self.inner.interceptor.wrap_unary(call)(ctx, Box::new(request) as Box<dyn AnyRequest>).await?;
        downcast_response::<Res>(response).ok_or_else(|| {
            Error::new(Code::Internal, "interceptor returned a response of the wrong type")
        })
    }

    /// Start a client-streaming call.
    #[instrument(
        skip_all,
        fields(
            rpc.system = "grpc",
            rpc.service = self.service(),
            rpc.method = self.method(),
            otel.kind = "client"
        )
    )]
    pub fn call_client_stream(&self, ctx: CallContext) -> ClientStreamCall<Req, Res> {
        let (sender, receiver) = self.inner.new_stream(ctx, StreamType::CLIENT);
        ClientStreamCall::new(sender, receiver)
    }

    /// Send one request and start reading a stream of responses.
    #[instrument(
        skip_all,
        fields(
            rpc.system = "grpc",
            rpc.service = self.service(),
            rpc.method = self.method(),
            otel.kind = "client"
        )
    )]
    pub async fn call_server_stream(
        &self,
        ctx: CallContext,
        request: Request<Req>,
    ) -> Result<ServerStreamCall<Res>, Error> {
        let (mut sender, mut receiver) = self.inner.new_stream(ctx, StreamType::SERVER);
        merge_headers(sender.header_mut(), request.header());
        if let Err(err) = send_single(sender.as_mut(), request.message()).await {
            let _ = receiver.close().await;
            return Err(err);
        }
        Ok(ServerStreamCall::new(receiver))
    }

    /// Start a bidirectional call. Requires HTTP/2.
    #[instrument(
        skip_all,
        fields(
            rpc.system = "grpc",
            rpc.service = self.service(),
            rpc.method = self.method(),
            otel.kind = "client"
        )
    )]
    pub fn call_bidi_stream(&self, ctx: CallContext) -> BidiStreamCall<Req, Res> {
        let (sender, receiver) = self.inner.new_stream(ctx, StreamType::BIDI);
        BidiStreamCall::new(sender, receiver)
    }
}

/// Builder for [`Client`]. Settings are validated by [`build`](Self::build).
pub struct ClientBuilder {
    base_url: String,
    procedure: String,
    protocol: Option<Protocol>,
    codec: Arc<dyn Codec>,
    compressors: Compressors,
    request_compression: Option<String>,
    compress_min_bytes: usize,
    read_max_bytes: usize,
    prefix_rewrite: Option<(String, String)>,
    interceptors: Vec<Arc<dyn Interceptor>>,
    http_client: Option<Arc<dyn HttpClient>>,
    config: ClientConfig,
}

impl ClientBuilder {
    /// `base_url` is scheme and authority (plus an optional path prefix);
    /// `procedure` is `package.Service/Method`.
    pub fn new(base_url: impl Into<String>, procedure: impl Into<String>) -> Self {
        let mut compressors = Compressors::new();
        compressors.register(COMPRESSION_GZIP, Arc::new(GzipCompression));
        Self {
            base_url: base_url.into(),
            procedure: procedure.into(),
            protocol: None,
            codec: Arc::new(ProtoBinaryCodec),
            compressors,
            request_compression: None,
            compress_min_bytes: DEFAULT_COMPRESS_MIN_BYTES,
            read_max_bytes: DEFAULT_READ_MAX_BYTES,
            prefix_rewrite: None,
            interceptors: Vec::new(),
            http_client: None,
            config: ClientConfig::default(),
        }
    }

    pub fn grpc(mut self) -> Self {
        self.protocol = Some(Protocol::Grpc);
        self
    }

    pub fn grpc_web(mut self) -> Self {
        self.protocol = Some(Protocol::GrpcWeb);
        self
    }

    pub fn codec(mut self, codec: impl Codec) -> Self {
        self.codec = Arc::new(codec);
        self
    }

    /// Register a compressor. It is advertised in `grpc-accept-encoding`
    /// and can be named by [`request_compression`](Self::request_compression).
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

    /// Compress requests with a registered compressor.
    pub fn request_compression(mut self, name: impl Into<String>) -> Self {
        self.request_compression = Some(name.into());
        self
    }

    /// Requests smaller than this are sent uncompressed.
    pub fn compress_min_bytes(mut self, bytes: usize) -> Self {
        self.compress_min_bytes = bytes;
        self
    }

    /// Largest response message accepted, after decompression. 0 is unlimited.
    pub fn read_max_bytes(mut self, bytes: usize) -> Self {
        self.read_max_bytes = bytes;
        self
    }

    /// Call `replacement...` instead of `prefix...`.
    pub fn replace_procedure_prefix(
        mut self,
        prefix: impl Into<String>,
        replacement: impl Into<String>,
    ) -> Self {
        self.prefix_rewrite = Some((prefix.into(), replacement.into()));
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

    /// Use a custom transport instead of the built-in hyper client.
    pub fn http_client(mut self, client: impl HttpClient) -> Self {
        self.http_client = Some(Arc::new(client));
        self
    }

    /// Connection settings for the built-in hyper client.
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build<Req, Res>(self) -> Result<Client<Req, Res>, Error>
    where
        Req: Message,
        Res: Message + Default,
    {
        let Some(protocol) = self.protocol else {
            return Err(Error::new(
                Code::Unknown,
                "no protocol configured: use either grpc() or grpc_web()",
            ));
        };
        if self.codec.name().is_empty() {
            return Err(Error::new(Code::Unknown, "no codec configured"));
        }
        let request_compression = match self.request_compression {
            None => None,
            Some(name) if name.is_empty() || name == COMPRESSION_IDENTITY => None,
            Some(name) if self.compressors.contains(&name) => Some(name),
            Some(name) => {
                return Err(Error::new(
                    Code::Unknown,
                    format!("unknown compression {name:?}"),
                ));
            }
        };

        let mut procedure = self.procedure.trim_start_matches('/').to_string();
        if let Some((prefix, replacement)) = &self.prefix_rewrite {
            if let Some(rest) = procedure.strip_prefix(prefix.as_str()) {
                procedure = format!("{replacement}{rest}");
            }
        }
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), procedure);
        let uri: Uri = url
            .parse()
            .map_err(|err| Error::from_source(Code::Unknown, err))?;
        if uri.scheme().is_none() || uri.authority().is_none() {
            return Err(Error::new(
                Code::Unknown,
                format!("invalid URL {url:?}: scheme and host are required"),
            ));
        }

        let http = match self.http_client {
            Some(http) => http,
            None => {
                let version = self.config.http_protocol.unwrap_or(match protocol {
                    Protocol::Grpc => HttpProtocol::Http2,
                    Protocol::GrpcWeb => HttpProtocol::Http1,
                });
                Arc::new(HyperClient::new(&self.config, version))
            }
        };

        Ok(Client {
            inner: Arc::new(ClientInner {
                procedure,
                uri,
                protocol: ClientProtocol {
                    protocol,
                    codec: self.codec,
                    compressors: Arc::new(self.compressors),
                    request_compression,
                    compress_min_bytes: self.compress_min_bytes,
                    read_max_bytes: self.read_max_bytes,
                },
                http,
                interceptor: Chain::new(self.interceptors),
            }),
            _marker: PhantomData,
        })
    }
}

impl fmt::Debug for ClientBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientBuilder")
            .field("base_url", &self.base_url)
            .field("procedure", &self.procedure)
            .field("protocol", &self.protocol)
            .field("codec", &self.codec.name())
            .field("compressors", &self.compressors)
            .field("request_compression", &self.request_compression)
            .field("interceptors", &self.interceptors.len())
            .finish()
    }
}
