//! gRPC and gRPC-Web client halves.
//!
//! Both variants share one implementation. The only differences are the
//! content type, the `te` header, and where the terminal status arrives:
//! HTTP trailers for gRPC, a trailer envelope at the end of the body for
//! gRPC-Web.

use crate::duplex::{duplex_call, RequestWriter, ResponseHead, ResponseReader, Validate};
use crate::transport::HttpClient;
use async_trait::async_trait;
use conduit_core::compression::COMPRESSION_IDENTITY;
use conduit_core::envelope::{EnvelopeReader, EnvelopeWriter, Inbound, MessageReader};
use conduit_core::header::merge_headers;
use conduit_core::protocol::{user_agent, GRPC_ACCEPT_ENCODING, GRPC_ENCODING};
use conduit_core::status::error_from_trailer;
use conduit_core::{
    Body, CallContext, Code, Codec, Compressors, Error, Message, Protocol, Receiver, Sender,
    Specification,
};
use http::header::{CONTENT_TYPE, TE, USER_AGENT};
use http::{HeaderMap, HeaderValue, StatusCode, Uri};
use std::sync::Arc;

/// Everything a client needs to open streams: the protocol variant plus the
/// codec and compression settings fixed at build time.
#[derive(Clone)]
pub(crate) struct ClientProtocol {
    pub protocol: Protocol,
    pub codec: Arc<dyn Codec>,
    pub compressors: Arc<Compressors>,
    /// `None` sends requests uncompressed.
    pub request_compression: Option<String>,
    pub compress_min_bytes: usize,
    pub read_max_bytes: usize,
}

impl ClientProtocol {
    /// Protocol headers every request starts with.
    pub(crate) fn request_header(&self) -> HeaderMap {
        let mut header = HeaderMap::with_capacity(8);
        if let Ok(value) = HeaderValue::from_str(&user_agent()) {
            header.insert(USER_AGENT, value);
        }
        if let Ok(value) = HeaderValue::from_str(&self.protocol.content_type(self.codec.name())) {
            header.insert(CONTENT_TYPE, value);
        }
        if let Some(name) = &self.request_compression {
            if let Ok(value) = HeaderValue::from_str(name) {
                header.insert(GRPC_ENCODING, value);
            }
        }
        let accept = self.compressors.comma_separated_names();
        if !accept.is_empty() {
            if let Ok(value) = HeaderValue::from_str(&accept) {
                header.insert(GRPC_ACCEPT_ENCODING, value);
            }
        }
        if !self.protocol.is_web() {
            header.insert(TE, HeaderValue::from_static("trailers"));
        }
        header
    }

    /// Open a call. Nothing touches the network until the first send.
    pub(crate) fn new_stream(
        &self,
        ctx: CallContext,
        spec: Specification,
        http: Arc<dyn HttpClient>,
        uri: Uri,
    ) -> (Box<dyn Sender>, Box<dyn Receiver>) {
        let (writer, response) = duplex_call(ctx, http, uri, validator(self.compressors.clone()));
        let compression = self
            .request_compression
            .as_deref()
            .and_then(|name| self.compressors.get(name));
        let sender = ClientSender {
            spec: spec.clone(),
            header: self.request_header(),
            writer,
            envelopes: EnvelopeWriter::new(self.codec.clone(), compression, self.compress_min_bytes),
        };
        let receiver = ClientReceiver {
            spec,
            response,
            codec: self.codec.clone(),
            compressors: self.compressors.clone(),
            read_max_bytes: self.read_max_bytes,
            web: self.protocol.is_web(),
            header: HeaderMap::new(),
            trailer: HeaderMap::new(),
            state: ReadState::Pending,
        };
        (Box::new(sender), Box::new(receiver))
    }
}

fn validator(compressors: Arc<Compressors>) -> Validate {
    Arc::new(move |response| {
        let compressors = compressors.clone();
        Box::pin(async move { validate_response(response, &compressors).await })
    })
}

/// Check status and compression, and split out a trailers-only error.
async fn validate_response(
    response: http::Response<Body>,
    compressors: &Compressors,
) -> (ResponseHead, Option<Error>) {
    let (parts, body) = response.into_parts();
    let mut head = ResponseHead::default();
    if parts.status != StatusCode::OK {
        let code = Code::from_http_status(parts.status.as_u16());
        return (head, Some(Error::new(code, format!("HTTP status {}", parts.status))));
    }
    let encoding = parts
        .headers
        .get(GRPC_ENCODING)
        .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned())
        .unwrap_or_default();
    if !encoding.is_empty() && encoding != COMPRESSION_IDENTITY && !compressors.contains(&encoding) {
        let err = Error::new(
            Code::Internal,
            format!(
                "unknown encoding {encoding:?}: accepted grpc-encoding values are {}",
                compressors.comma_separated_names()
            ),
        );
        return (head, Some(err));
    }
    if let Some(err) = error_from_trailer(&parts.headers) {
        // Only the status line and content type are headers here; the rest
        // is trailing metadata.
        if let Some(content_type) = parts.headers.get(CONTENT_TYPE) {
            head.header.insert(CONTENT_TYPE, content_type.clone());
        }
        merge_headers(&mut head.trailer, &parts.headers);
        head.trailer.remove(CONTENT_TYPE);
        let mut rest = EnvelopeReader::new(body, 0);
        let _ = rest.drain().await;
        merge_headers(&mut head.trailer, rest.trailers());
        let mut metadata = parts.headers.clone();
        merge_headers(&mut metadata, rest.trailers());
        return (head, Some(err.with_metadata(metadata)));
    }
    head.header = parts.headers;
    head.body = Some(body);
    (head, None)
}

struct ClientSender {
    spec: Specification,
    header: HeaderMap,
    writer: RequestWriter,
    envelopes: EnvelopeWriter,
}

#[async_trait]
impl Sender for ClientSender {
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
        None
    }

    async fn send(&mut self, message: &dyn Message) -> Result<(), Error> {
        let data = self.envelopes.encode_message(message)?;
        self.writer.send(&self.header, data).await
    }

    async fn close(&mut self, _err: Option<Error>) -> Result<(), Error> {
        self.writer.close(&self.header);
        Ok(())
    }
}

enum ReadState {
    Pending,
    Streaming(MessageReader),
    Done,
}

struct ClientReceiver {
    spec: Specification,
    response: ResponseReader,
    codec: Arc<dyn Codec>,
    compressors: Arc<Compressors>,
    read_max_bytes: usize,
    web: bool,
    header: HeaderMap,
    trailer: HeaderMap,
    state: ReadState,
}

impl ClientReceiver {
    async fn start(&mut self) -> Result<Option<MessageReader>, Error> {
        let (head, err) = self.response.start().await;
        merge_headers(&mut self.header, &head.header);
        merge_headers(&mut self.trailer, &head.trailer);
        if let Some(err) = err {
            return Err(err);
        }
        let Some(body) = head.body else {
            return Ok(None);
        };
        let compression = self
            .header
            .get(GRPC_ENCODING)
            .and_then(|value| value.to_str().ok())
            .filter(|name| *name != COMPRESSION_IDENTITY)
            .and_then(|name| self.compressors.get(name));
        Ok(Some(MessageReader::new(
            body,
            self.codec.clone(),
            compression,
            self.read_max_bytes,
            self.web,
        )))
    }

    /// Status sent by the server, with headers and trailers as metadata.
    fn server_error(&self) -> Option<Error> {
        error_from_trailer(&self.trailer).map(|err| {
            let mut metadata = self.header.clone();
            merge_headers(&mut metadata, &self.trailer);
            err.with_metadata(metadata)
        })
    }

    fn finish(&mut self) -> Result<bool, Error> {
        self.state = ReadState::Done;
        match self.server_error() {
            Some(err) => {
                self.response.set_error(err.clone());
                Err(err)
            }
            None => Ok(false),
        }
    }
}

#[async_trait]
impl Receiver for ClientReceiver {
    fn spec(&self) -> &Specification {
        &self.spec
    }

    async fn receive(&mut self, message: &mut dyn Message) -> Result<bool, Error> {
        if matches!(self.state, ReadState::Pending) {
            match self.start().await {
                Ok(Some(reader)) => self.state = ReadState::Streaming(reader),
                Ok(None) => return self.finish(),
                Err(err) => {
                    self.state = ReadState::Done;
                    return Err(err);
                }
            }
        }
        let ReadState::Streaming(reader) = &mut self.state else {
            return self.response.error().map_or(Ok(false), Err);
        };
        let ctx = self.response.context();
        let read = tokio::select! {
            read = reader.read(message) => read,
            err = ctx.done() => Err(err),
        };
        match read {
            Ok(Inbound::Message) => Ok(true),
            Ok(Inbound::Trailers(trailers)) => {
                merge_headers(&mut self.trailer, &trailers);
                self.finish()
            }
            Ok(Inbound::End) => {
                merge_headers(&mut self.trailer, reader.http_trailers());
                self.finish()
            }
            Err(err) => {
                // A missing or garbled message often means the server
                // reported failure through trailers instead.
                let _ = reader.drain().await;
                merge_headers(&mut self.trailer, reader.http_trailers());
                let err = self.server_error().unwrap_or(err);
                self.state = ReadState::Done;
                self.response.set_error(err.clone());
                Err(err)
            }
        }
    }

    async fn close(&mut self) -> Result<(), Error> {
        self.state = ReadState::Done;
        Ok(())
    }

    fn header(&self) -> &HeaderMap {
        &self.header
    }

    fn header_mut(&mut self) -> &mut HeaderMap {
        &mut self.header
    }

    fn trailer(&self) -> Option<&HeaderMap> {
        Some(&self.trailer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_core::compression::GzipCompression;
    use conduit_core::envelope::EnvelopeWriter;
    use conduit_core::protocol::{GRPC_MESSAGE, GRPC_STATUS};
    use conduit_core::status::error_to_trailer;
    use conduit_core::{ProtoBinaryCodec, StreamType};
    use futures_util::stream;
    use http_body::Frame;
    use http_body_util::{BodyExt, StreamBody};

    /// Replies with a canned response regardless of the request.
    struct Canned {
        status: StatusCode,
        header: HeaderMap,
        frames: Vec<Frame<bytes::Bytes>>,
    }

    #[async_trait]
    impl HttpClient for Canned {
        async fn request(&self, request: http::Request<Body>) -> Result<http::Response<Body>, Error> {
            let _ = request.into_body().collect().await;
            let frames: Vec<Result<Frame<bytes::Bytes>, conduit_core::BoxError>> = self
                .frames
                .iter()
                .map(|frame| {
                    Ok(match frame.data_ref() {
                        Some(data) => Frame::data(data.clone()),
                        None => Frame::trailers(frame.trailers_ref().cloned().unwrap_or_default()),
                    })
                })
                .collect();
            let mut response =
                http::Response::new(StreamBody::new(stream::iter(frames)).boxed_unsync());
            *response.status_mut() = self.status;
            *response.headers_mut() = self.header.clone();
            Ok(response)
        }
    }

    fn protocol(protocol: Protocol) -> ClientProtocol {
        let mut compressors = Compressors::new();
        compressors.register("gzip", Arc::new(GzipCompression));
        ClientProtocol {
            protocol,
            codec: Arc::new(ProtoBinaryCodec),
            compressors: Arc::new(compressors),
            request_compression: None,
            compress_min_bytes: 0,
            read_max_bytes: 0,
        }
    }

    fn message_frame(seconds: i64) -> Frame<bytes::Bytes> {
        let writer = EnvelopeWriter::new(Arc::new(ProtoBinaryCodec), None, 0);
        Frame::data(
            writer
                .encode_message(&prost_types::Duration { seconds, nanos: 0 })
                .unwrap(),
        )
    }

    fn status_trailers(err: Option<&Error>) -> HeaderMap {
        let mut trailers = HeaderMap::new();
        error_to_trailer(&mut trailers, err);
        trailers
    }

    async fn open(
        client: &ClientProtocol,
        canned: Canned,
    ) -> (Box<dyn Sender>, Box<dyn Receiver>) {
        let spec = Specification::new("svc.S/M", StreamType::UNARY, true);
        let (mut sender, receiver) = client.new_stream(
            CallContext::new(),
            spec,
            Arc::new(canned),
            Uri::from_static("http://localhost/svc.S/M"),
        );
        sender.send(&prost_types::Duration::default()).await.unwrap();
        sender.close(None).await.unwrap();
        (sender, receiver)
    }

    #[test]
    fn test_request_header() {
        let mut client = protocol(Protocol::Grpc);
        client.request_compression = Some("gzip".to_string());
        let header = client.request_header();
        assert_eq!(header.get(CONTENT_TYPE).unwrap(), "application/grpc+proto");
        assert_eq!(header.get(GRPC_ENCODING).unwrap(), "gzip");
        assert_eq!(header.get(GRPC_ACCEPT_ENCODING).unwrap(), "gzip");
        assert_eq!(header.get(TE).unwrap(), "trailers");
        assert!(header
            .get(USER_AGENT)
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("grpc-rust-conduit/"));

        let web = protocol(Protocol::GrpcWeb).request_header();
        assert_eq!(web.get(CONTENT_TYPE).unwrap(), "application/grpc-web+proto");
        assert!(web.get(TE).is_none());
        assert!(web.get(GRPC_ENCODING).is_none());
    }

    #[tokio::test]
    async fn test_grpc_message_and_trailers() {
        let mut header = HeaderMap::new();
        header.insert("x-header", HeaderValue::from_static("h"));
        let mut trailers = status_trailers(None);
        trailers.insert("x-trailer", HeaderValue::from_static("t"));
        let canned = Canned {
            status: StatusCode::OK,
            header,
            frames: vec![message_frame(7), Frame::trailers(trailers)],
        };
        let (_, mut receiver) = open(&protocol(Protocol::Grpc), canned).await;
        let mut message = prost_types::Duration::default();
        assert!(receiver.receive(&mut message).await.unwrap());
        assert_eq!(message.seconds, 7);
        assert!(!receiver.receive(&mut message).await.unwrap());
        assert_eq!(receiver.header().get("x-header").unwrap(), "h");
        assert_eq!(receiver.trailer().unwrap().get("x-trailer").unwrap(), "t");
    }

    #[tokio::test]
    async fn test_grpc_web_trailer_envelope() {
        let err = Error::new(Code::NotFound, "no such thing");
        let writer = EnvelopeWriter::new(Arc::new(ProtoBinaryCodec), None, 0);
        let canned = Canned {
            status: StatusCode::OK,
            header: HeaderMap::new(),
            frames: vec![
                message_frame(1),
                Frame::data(writer.encode_trailers(&status_trailers(Some(&err)))),
            ],
        };
        let (_, mut receiver) = open(&protocol(Protocol::GrpcWeb), canned).await;
        let mut message = prost_types::Duration::default();
        assert!(receiver.receive(&mut message).await.unwrap());
        let got = receiver.receive(&mut message).await.unwrap_err();
        assert_eq!(got.code(), Code::NotFound);
        assert_eq!(got.message(), "no such thing");
        assert!(got.metadata().contains_key(GRPC_STATUS));
        // Later receives keep reporting the same failure.
        let again = receiver.receive(&mut message).await.unwrap_err();
        assert_eq!(again.code(), Code::NotFound);
    }

    #[tokio::test]
    async fn test_trailers_only_error() {
        let err = Error::new(Code::PermissionDenied, "go away");
        let mut header = status_trailers(Some(&err));
        header.insert(CONTENT_TYPE, HeaderValue::from_static("application/grpc+proto"));
        header.insert("x-extra", HeaderValue::from_static("1"));
        let canned = Canned {
            status: StatusCode::OK,
            header,
            frames: Vec::new(),
        };
        let (_, mut receiver) = open(&protocol(Protocol::Grpc), canned).await;
        let got = receiver
            .receive(&mut prost_types::Duration::default())
            .await
            .unwrap_err();
        assert_eq!(got.code(), Code::PermissionDenied);
        assert_eq!(got.metadata().get("x-extra").unwrap(), "1");
        assert_eq!(
            receiver.header().get(CONTENT_TYPE).unwrap(),
            "application/grpc+proto"
        );
        assert!(receiver.header().get("x-extra").is_none());
        let trailer = receiver.trailer().unwrap();
        assert_eq!(trailer.get("x-extra").unwrap(), "1");
        assert!(trailer.get(GRPC_MESSAGE).is_some());
        assert!(trailer.get(CONTENT_TYPE).is_none());
    }

    #[tokio::test]
    async fn test_http_status_mapping() {
        let canned = Canned {
            status: StatusCode::SERVICE_UNAVAILABLE,
            header: HeaderMap::new(),
            frames: Vec::new(),
        };
        let (_, mut receiver) = open(&protocol(Protocol::Grpc), canned).await;
        let got = receiver
            .receive(&mut prost_types::Duration::default())
            .await
            .unwrap_err();
        assert_eq!(got.code(), Code::Unavailable);
        assert!(got.message().starts_with("HTTP status 503"));
    }

    #[tokio::test]
    async fn test_unknown_response_encoding() {
        let mut header = HeaderMap::new();
        header.insert(GRPC_ENCODING, HeaderValue::from_static("snappy"));
        let canned = Canned {
            status: StatusCode::OK,
            header,
            frames: vec![message_frame(1)],
        };
        let (_, mut receiver) = open(&protocol(Protocol::Grpc), canned).await;
        let got = receiver
            .receive(&mut prost_types::Duration::default())
            .await
            .unwrap_err();
        assert_eq!(got.code(), Code::Internal);
        assert!(got.message().contains("snappy"));
    }

    #[tokio::test]
    async fn test_garbled_body_prefers_trailer_status() {
        let err = Error::new(Code::ResourceExhausted, "too big");
        let canned = Canned {
            status: StatusCode::OK,
            header: HeaderMap::new(),
            frames: vec![
                Frame::data(bytes::Bytes::from_static(&[0, 0, 0, 0, 9, 1])),
                Frame::trailers(status_trailers(Some(&err))),
            ],
        };
        let (_, mut receiver) = open(&protocol(Protocol::Grpc), canned).await;
        let got = receiver
            .receive(&mut prost_types::Duration::default())
            .await
            .unwrap_err();
        assert_eq!(got.code(), Code::ResourceExhausted);
    }
}
