//! gRPC and gRPC-Web handler halves.
//!
//! The response is produced by the handler task while the HTTP service
//! future waits: headers travel over a oneshot as soon as the first message
//! or the close is written, and body frames (messages, then HTTP trailers or
//! a gRPC-Web trailer envelope) over a bounded channel.

use async_trait::async_trait;
use bytes::Bytes;
use conduit_core::compression::COMPRESSION_IDENTITY;
use conduit_core::envelope::{EnvelopeWriter, Inbound, MessageReader};
use conduit_core::header::merge_headers;
use conduit_core::protocol::{GRPC_ACCEPT_ENCODING, GRPC_ENCODING};
use conduit_core::status::error_to_trailer;
use conduit_core::{
    Body, BoxError, CallContext, Code, Codec, Codecs, Compressors, Error, Message, NopReceiver,
    Protocol, Receiver, Sender, Specification,
};
use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderValue};
use http_body::Frame;
use http_body_util::BodyExt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

const FRAME_BUFFER: usize = 8;

type FrameResult = Result<Frame<Bytes>, BoxError>;

/// One protocol variant, configured for one handler.
#[derive(Clone)]
pub(crate) struct HandlerProtocol {
    pub protocol: Protocol,
    pub codecs: Arc<Codecs>,
    pub compressors: Arc<Compressors>,
    pub compress_min_bytes: usize,
    pub read_max_bytes: usize,
}

/// Both halves of a handler call plus the response they feed.
pub(crate) struct HandlerStream {
    pub sender: Box<dyn Sender>,
    pub receiver: Box<dyn Receiver>,
    pub response: PendingResponse,
    /// Protocol failure to deliver instead of running the implementation.
    pub error: Option<Error>,
}

impl HandlerProtocol {
    /// Codec for a request content type, if this variant serves it.
    pub(crate) fn codec_for(&self, content_type: &str) -> Option<Arc<dyn Codec>> {
        self.protocol
            .codec_from_content_type(content_type)
            .and_then(|name| self.codecs.get(name))
    }

    pub(crate) fn accepted_content_types(&self) -> Vec<String> {
        self.protocol.accepted_content_types(self.codecs.names())
    }

    /// Build the handler halves for one request.
    ///
    /// `error` carries a failure found before this point (a bad timeout);
    /// compression negotiation may add one. With an error the receiver is a
    /// stand-in and the request body is dropped unread.
    pub(crate) fn new_stream(
        &self,
        spec: Specification,
        ctx: CallContext,
        codec: Arc<dyn Codec>,
        request_header: HeaderMap,
        body: Body,
        mut error: Option<Error>,
    ) -> HandlerStream {
        let (request_compression, response_compression) = match self.compressors.negotiate(
            header_str(&request_header, GRPC_ENCODING).as_deref(),
            header_str(&request_header, GRPC_ACCEPT_ENCODING).as_deref(),
        ) {
            Ok(negotiated) => negotiated,
            Err(err) => {
                error.get_or_insert(err);
                (
                    COMPRESSION_IDENTITY.to_string(),
                    COMPRESSION_IDENTITY.to_string(),
                )
            }
        };
        debug!(
            procedure = %spec.procedure,
            protocol = ?self.protocol,
            request_compression = %request_compression,
            response_compression = %response_compression,
            "stream opened"
        );

        let mut header = HeaderMap::with_capacity(4);
        if let Some(content_type) = request_header.get(CONTENT_TYPE) {
            header.insert(CONTENT_TYPE, content_type.clone());
        }
        let accept = self.compressors.comma_separated_names();
        if let Ok(value) = HeaderValue::from_str(&accept) {
            if !accept.is_empty() {
                header.insert(GRPC_ACCEPT_ENCODING, value);
            }
        }
        if response_compression != COMPRESSION_IDENTITY {
            if let Ok(value) = HeaderValue::from_str(&response_compression) {
                header.insert(GRPC_ENCODING, value);
            }
        }

        let (head_tx, head_rx) = oneshot::channel();
        let (frames_tx, frames_rx) = mpsc::channel(FRAME_BUFFER);
        let sender = HandlerSender {
            spec: spec.clone(),
            web: self.protocol.is_web(),
            writer: EnvelopeWriter::new(
                codec.clone(),
                self.compressors.get(&response_compression),
                self.compress_min_bytes,
            ),
            header,
            trailer: HeaderMap::new(),
            head: Some(head_tx),
            frames: Some(frames_tx),
        };
        let receiver: Box<dyn Receiver> = if error.is_some() {
            Box::new(NopReceiver::new(spec, request_header, None))
        } else {
            Box::new(HandlerReceiver {
                reader: Some(MessageReader::new(
                    body,
                    codec,
                    self.compressors.get(&request_compression),
                    self.read_max_bytes,
                    self.protocol.is_web(),
                )),
                spec,
                ctx,
                header: request_header,
            })
        };
        HandlerStream {
            sender: Box::new(sender),
            receiver,
            response: PendingResponse {
                head: head_rx,
                frames: frames_rx,
            },
            error,
        }
    }
}

fn header_str(header: &HeaderMap, name: http::HeaderName) -> Option<String> {
    header
        .get(name)
        .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned())
}

/// The response a handler task has yet to start.
pub(crate) struct PendingResponse {
    head: oneshot::Receiver<HeaderMap>,
    frames: mpsc::Receiver<FrameResult>,
}

impl PendingResponse {
    /// Wait for the response headers and return the streaming response.
    ///
    /// `ctx` is canceled when the response body is dropped, or when this
    /// future is, which is how the handler learns the client went away.
    pub(crate) async fn into_response(self, ctx: CallContext) -> http::Response<Body> {
        let guard = CancelOnDrop(ctx);
        let header = match self.head.await {
            Ok(header) => header,
            Err(_) => {
                let mut header = HeaderMap::new();
                let err = Error::new(Code::Internal, "handler exited without a response");
                error_to_trailer(&mut header, Some(&err));
                header
            }
        };
        let body = ResponseBody {
            frames: self.frames,
            _guard: guard,
        };
        let mut response = http::Response::new(body.boxed_unsync());
        *response.headers_mut() = header;
        response
    }
}

struct CancelOnDrop(CallContext);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

struct ResponseBody {
    frames: mpsc::Receiver<FrameResult>,
    _guard: CancelOnDrop,
}

impl http_body::Body for ResponseBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        self.frames.poll_recv(cx)
    }
}

struct HandlerSender {
    spec: Specification,
    web: bool,
    writer: EnvelopeWriter,
    header: HeaderMap,
    trailer: HeaderMap,
    /// Present until the response headers are sent.
    head: Option<oneshot::Sender<HeaderMap>>,
    /// Present until the stream is closed.
    frames: Option<mpsc::Sender<FrameResult>>,
}

impl HandlerSender {
    fn send_head(&mut self, header: HeaderMap) {
        if let Some(head) = self.head.take() {
            let _ = head.send(header);
        }
    }

    fn flush_header(&mut self) {
        if self.head.is_some() {
            let header = self.header.clone();
            self.send_head(header);
        }
    }

    async fn push(&self, frame: Frame<Bytes>) -> Result<(), Error> {
        let Some(frames) = &self.frames else {
            return Err(Error::new(Code::FailedPrecondition, "stream already closed"));
        };
        frames
            .send(Ok(frame))
            .await
            .map_err(|_| Error::new(Code::Canceled, "client disconnected"))
    }
}

#[async_trait]
impl Sender for HandlerSender {
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

    async fn send(&mut self, message: &dyn Message) -> Result<(), Error> {
        if self.frames.is_none() {
            return Err(Error::new(Code::FailedPrecondition, "send after close"));
        }
        self.flush_header();
        let data = self.writer.encode_message(message)?;
        self.push(Frame::data(data)).await
    }

    async fn close(&mut self, err: Option<Error>) -> Result<(), Error> {
        if self.frames.is_none() {
            return Ok(());
        }
        // The user-visible trailer map stays untouched.
        let mut trailers = HeaderMap::with_capacity(self.trailer.len() + 3);
        merge_headers(&mut trailers, &self.trailer);
        error_to_trailer(&mut trailers, err.as_ref());

        let result = if self.web && self.head.is_some() {
            // Trailers-only gRPC-Web response: the status goes in the headers.
            let mut header = self.header.clone();
            merge_headers(&mut header, &trailers);
            self.send_head(header);
            Ok(())
        } else {
            self.flush_header();
            let frame = if self.web {
                Frame::data(self.writer.encode_trailers(&trailers))
            } else {
                Frame::trailers(trailers)
            };
            self.push(frame).await
        };
        self.frames = None;
        debug!(
            procedure = %self.spec.procedure,
            code = %err.as_ref().map_or(Code::Ok, Error::code),
            "stream closed"
        );
        result
    }
}

struct HandlerReceiver {
    spec: Specification,
    ctx: CallContext,
    header: HeaderMap,
    /// `None` once the request body is finished or released.
    reader: Option<MessageReader>,
}

#[async_trait]
impl Receiver for HandlerReceiver {
    fn spec(&self) -> &Specification {
        &self.spec
    }

    async fn receive(&mut self, message: &mut dyn Message) -> Result<bool, Error> {
        let Some(reader) = self.reader.as_mut() else {
            return Ok(false);
        };
        let read = tokio::select! {
            read = reader.read(message) => read,
            err = self.ctx.done() => Err(err),
        };
        match read {
            Ok(Inbound::Message) => Ok(true),
            Ok(Inbound::Trailers(_)) | Ok(Inbound::End) => {
                self.reader = None;
                Ok(false)
            }
            Err(err) => {
                self.reader = None;
                Err(err)
            }
        }
    }

    async fn close(&mut self) -> Result<(), Error> {
        // Unread request data is dropped rather than drained, so a client
        // that never finishes its body cannot hold the handler open.
        self.reader = None;
        Ok(())
    }

    fn header(&self) -> &HeaderMap {
        &self.header
    }

    fn header_mut(&mut self) -> &mut HeaderMap {
        &mut self.header
    }

    fn trailer(&self) -> Option<&HeaderMap> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_core::compression::GzipCompression;
    use conduit_core::envelope::EnvelopeReader;
    use conduit_core::protocol::{GRPC_MESSAGE, GRPC_STATUS};
    use conduit_core::status::error_from_trailer;
    use conduit_core::{ProtoBinaryCodec, StreamType, COMPRESSION_GZIP};
    use http_body_util::Full;
    use prost_types::Duration;

    fn protocol(protocol: Protocol) -> HandlerProtocol {
        let mut compressors = Compressors::new();
        compressors.register(COMPRESSION_GZIP, Arc::new(GzipCompression));
        HandlerProtocol {
            protocol,
            codecs: Arc::new(Codecs::default()),
            compressors: Arc::new(compressors),
            compress_min_bytes: 0,
            read_max_bytes: 0,
        }
    }

    fn spec() -> Specification {
        Specification::new("svc.S/M", StreamType::UNARY, false)
    }

    fn request_body(values: &[i64]) -> Body {
        let writer = EnvelopeWriter::new(Arc::new(ProtoBinaryCodec), None, 0);
        let mut data = Vec::new();
        for &seconds in values {
            let envelope = writer
                .encode_message(&Duration { seconds, nanos: 0 })
                .unwrap();
            data.extend_from_slice(&envelope);
        }
        Full::new(Bytes::from(data))
            .map_err(|never| match never {})
            .boxed_unsync()
    }

    fn request_header(content_type: &'static str) -> HeaderMap {
        let mut header = HeaderMap::new();
        header.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
        header
    }

    fn open(variant: Protocol, header: HeaderMap, values: &[i64]) -> HandlerStream {
        let protocol = protocol(variant);
        protocol.new_stream(
            spec(),
            CallContext::new(),
            Arc::new(ProtoBinaryCodec),
            header,
            request_body(values),
            None,
        )
    }

    /// Collect a response into headers, decoded messages and trailers.
    async fn collect(response: http::Response<Body>, web: bool) -> (HeaderMap, Vec<i64>, HeaderMap) {
        let (parts, body) = response.into_parts();
        let mut reader = MessageReader::new(body, Arc::new(ProtoBinaryCodec), None, 0, web);
        let mut values = Vec::new();
        let mut trailers = HeaderMap::new();
        loop {
            let mut message = Duration::default();
            match reader.read(&mut message).await.unwrap() {
                Inbound::Message => values.push(message.seconds),
                Inbound::Trailers(block) => trailers = block,
                Inbound::End => break,
            }
        }
        merge_headers(&mut trailers, reader.http_trailers());
        (parts.headers, values, trailers)
    }

    #[test]
    fn test_codec_for_content_type() {
        let grpc = protocol(Protocol::Grpc);
        assert!(grpc.codec_for("application/grpc").is_some());
        assert!(grpc.codec_for("application/grpc+proto").is_some());
        assert!(grpc.codec_for("application/grpc+json").is_none());
        assert!(grpc.codec_for("application/grpc-web+proto").is_none());
        assert_eq!(
            grpc.accepted_content_types(),
            vec!["application/grpc", "application/grpc+proto"]
        );
    }

    #[tokio::test]
    async fn test_grpc_echo_with_http_trailers() {
        let mut stream = open(Protocol::Grpc, request_header("application/grpc"), &[7]);
        let mut message = Duration::default();
        assert!(stream.receiver.receive(&mut message).await.unwrap());
        assert_eq!(message.seconds, 7);
        assert!(!stream.receiver.receive(&mut message).await.unwrap());

        stream
            .sender
            .header_mut()
            .insert("x-custom", HeaderValue::from_static("yes"));
        stream
            .sender
            .trailer_mut()
            .unwrap()
            .insert("x-trailer", HeaderValue::from_static("done"));
        stream.sender.send(&message).await.unwrap();
        stream.sender.close(None).await.unwrap();

        let response = stream.response.into_response(CallContext::new()).await;
        let (header, values, trailers) = collect(response, false).await;
        assert_eq!(header[CONTENT_TYPE], "application/grpc");
        assert_eq!(header["x-custom"], "yes");
        assert_eq!(header[GRPC_ACCEPT_ENCODING], "gzip");
        assert_eq!(values, vec![7]);
        assert_eq!(trailers[GRPC_STATUS], "0");
        assert_eq!(trailers["x-trailer"], "done");
    }

    #[tokio::test]
    async fn test_grpc_web_trailers_only() {
        let mut stream = open(
            Protocol::GrpcWeb,
            request_header("application/grpc-web+proto"),
            &[],
        );
        let err = Error::new(Code::NotFound, "no such thing");
        stream.sender.close(Some(err)).await.unwrap();

        let response = stream.response.into_response(CallContext::new()).await;
        let (header, values, trailers) = collect(response, true).await;
        assert!(values.is_empty());
        assert!(trailers.is_empty());
        assert_eq!(header[GRPC_STATUS], "5");
        assert_eq!(header[GRPC_MESSAGE], "no such thing");
        assert_eq!(error_from_trailer(&header).unwrap().code(), Code::NotFound);
    }

    #[tokio::test]
    async fn test_grpc_web_trailer_envelope_after_body() {
        let mut stream = open(
            Protocol::GrpcWeb,
            request_header("application/grpc-web+proto"),
            &[],
        );
        stream
            .sender
            .send(&Duration { seconds: 1, nanos: 0 })
            .await
            .unwrap();
        stream
            .sender
            .close(Some(Error::new(Code::Aborted, "stopped")))
            .await
            .unwrap();

        let response = stream.response.into_response(CallContext::new()).await;
        let (header, values, trailers) = collect(response, true).await;
        assert!(!header.contains_key(GRPC_STATUS));
        assert_eq!(values, vec![1]);
        assert_eq!(error_from_trailer(&trailers).unwrap().code(), Code::Aborted);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_send_after_close_fails() {
        let mut stream = open(Protocol::Grpc, request_header("application/grpc"), &[]);
        stream.sender.close(None).await.unwrap();
        stream.sender.close(None).await.unwrap();
        let err = stream
            .sender
            .send(&Duration::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::FailedPrecondition);
    }

    #[tokio::test]
    async fn test_unsupported_request_compression() {
        let mut header = request_header("application/grpc");
        header.insert(GRPC_ENCODING, HeaderValue::from_static("snappy"));
        let mut stream = open(Protocol::Grpc, header, &[1]);
        let err = stream.error.take().unwrap();
        assert_eq!(err.code(), Code::Unimplemented);
        assert!(err.message().contains("gzip"));
        // The stand-in receiver yields nothing.
        let mut message = Duration::default();
        assert!(!stream.receiver.receive(&mut message).await.unwrap());
    }

    #[tokio::test]
    async fn test_response_compression_follows_accept_encoding() {
        let mut header = request_header("application/grpc");
        header.insert(GRPC_ACCEPT_ENCODING, HeaderValue::from_static("br, gzip"));
        let mut stream = open(Protocol::Grpc, header, &[]);
        stream
            .sender
            .send(&Duration { seconds: 9, nanos: 0 })
            .await
            .unwrap();
        stream.sender.close(None).await.unwrap();

        let response = stream.response.into_response(CallContext::new()).await;
        assert_eq!(response.headers()[GRPC_ENCODING], "gzip");
        let mut envelopes = EnvelopeReader::new(response.into_body(), 0);
        let envelope = envelopes.next_envelope().await.unwrap().unwrap();
        assert!(envelope.flags.is_compressed());
    }

    #[tokio::test]
    async fn test_dropping_response_cancels_context() {
        let stream = open(Protocol::Grpc, request_header("application/grpc"), &[]);
        let HandlerStream {
            mut sender,
            response,
            ..
        } = stream;
        sender.close(None).await.unwrap();
        let ctx = CallContext::new();
        let response = response.into_response(ctx.clone()).await;
        assert!(!ctx.is_canceled());
        drop(response);
        assert!(ctx.is_canceled());
    }

    #[tokio::test]
    async fn test_sender_dropped_without_response() {
        let stream = open(Protocol::Grpc, request_header("application/grpc"), &[]);
        let HandlerStream {
            sender, response, ..
        } = stream;
        drop(sender);
        let response = response.into_response(CallContext::new()).await;
        let err = error_from_trailer(response.headers()).unwrap();
        assert_eq!(err.code(), Code::Internal);
    }
}
