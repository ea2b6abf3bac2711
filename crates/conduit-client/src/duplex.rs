//! One streaming HTTP exchange, driven by a send half and a receive half.
//!
//! The request is issued lazily by the first send (or close) on a spawned
//! task, with a bounded channel as its body. The send half can therefore
//! start writing before the server has answered, which HTTP/1.1 transports
//! need before they will read a response. The task publishes the validated
//! response, or the failure, and then flips a ready signal exactly once.

use crate::transport::HttpClient;
use bytes::Bytes;
use conduit_core::protocol::GRPC_TIMEOUT;
use conduit_core::timeout::encode_timeout;
use conduit_core::{Body, BoxError, CallContext, Code, Error};
use futures_util::future::BoxFuture;
use futures_util::StreamExt;
use http::{HeaderMap, HeaderValue, Method, Uri};
use http_body::Frame;
use http_body_util::{BodyExt, StreamBody};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

/// Response metadata and body, as handed to the receive half.
#[derive(Default)]
pub(crate) struct ResponseHead {
    pub header: HeaderMap,
    pub trailer: HeaderMap,
    pub body: Option<Body>,
}

/// Checks a response before it is published. An error is stored as the
/// call's terminal failure; the head is published either way.
pub(crate) type Validate =
    Arc<dyn Fn(http::Response<Body>) -> BoxFuture<'static, (ResponseHead, Option<Error>)> + Send + Sync>;

struct Shared {
    ready: watch::Sender<bool>,
    error: Mutex<Option<Error>>,
    response: Mutex<Option<ResponseHead>>,
}

impl Shared {
    fn set_error(&self, err: Error) {
        let mut slot = self.error.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    fn error(&self) -> Option<Error> {
        self.error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn wait_ready(&self) {
        let mut ready = self.ready.subscribe();
        let _ = ready.wait_for(|ready| *ready).await;
    }
}

/// Create both halves of a call to `uri`.
pub(crate) fn duplex_call(
    ctx: CallContext,
    http: Arc<dyn HttpClient>,
    uri: Uri,
    validate: Validate,
) -> (RequestWriter, ResponseReader) {
    let (ready, _) = watch::channel(false);
    let shared = Arc::new(Shared {
        ready,
        error: Mutex::new(None),
        response: Mutex::new(None),
    });
    let writer = RequestWriter {
        ctx: ctx.clone(),
        http,
        uri,
        validate,
        shared: shared.clone(),
        phase: Phase::Unprepared,
    };
    (writer, ResponseReader { ctx, shared })
}

enum Phase {
    Unprepared,
    Open(mpsc::Sender<Bytes>),
    Closed,
}

/// Send half: owns the request body channel.
pub(crate) struct RequestWriter {
    ctx: CallContext,
    http: Arc<dyn HttpClient>,
    uri: Uri,
    validate: Validate,
    shared: Arc<Shared>,
    phase: Phase,
}

impl RequestWriter {
    /// Write one encoded envelope, starting the request if needed.
    ///
    /// Once the server stops reading, this waits for the response and
    /// returns the call's failure, or [`Error::end_of_stream`] if there is
    /// none.
    pub(crate) async fn send(&mut self, header: &HeaderMap, data: Bytes) -> Result<(), Error> {
        if let Some(err) = self.shared.error() {
            return Err(err);
        }
        self.prepare(header);
        let Phase::Open(body) = &self.phase else {
            return Err(Error::new(Code::FailedPrecondition, "send after close"));
        };
        let sent = tokio::select! {
            sent = body.send(data) => sent.is_ok(),
            err = self.ctx.done() => return Err(err),
        };
        if sent {
            return Ok(());
        }
        self.shared.wait_ready().await;
        Err(self.shared.error().unwrap_or_else(Error::end_of_stream))
    }

    /// End the request body. Starts the request first if nothing was sent.
    pub(crate) fn close(&mut self, header: &HeaderMap) {
        self.prepare(header);
        self.phase = Phase::Closed;
    }

    fn prepare(&mut self, header: &HeaderMap) {
        if !matches!(self.phase, Phase::Unprepared) {
            return;
        }
        let (tx, rx) = mpsc::channel::<Bytes>(1);
        self.phase = Phase::Open(tx);

        let body = StreamBody::new(
            ReceiverStream::new(rx).map(|data| Ok::<_, BoxError>(Frame::data(data))),
        )
        .boxed_unsync();
        let mut request = http::Request::new(body);
        *request.method_mut() = Method::POST;
        *request.uri_mut() = self.uri.clone();
        *request.headers_mut() = header.clone();
        if let Some(timeout) = self.ctx.remaining().and_then(encode_timeout) {
            if let Ok(value) = HeaderValue::from_str(&timeout) {
                request.headers_mut().insert(GRPC_TIMEOUT, value);
            }
        }

        let ctx = self.ctx.clone();
        let http = self.http.clone();
        let validate = self.validate.clone();
        let shared = self.shared.clone();
        tokio::spawn(async move {
            let result = match ctx.err() {
                Some(err) => Err(err),
                None => tokio::select! {
                    err = ctx.done() => Err(err),
                    result = http.request(request) => result,
                },
            };
            match result {
                Ok(response) => {
                    let (head, err) = validate(response).await;
                    if let Some(err) = err {
                        debug!(code = %err.code(), "response rejected: {}", err.message());
                        shared.set_error(err);
                    }
                    *shared.response.lock().unwrap_or_else(PoisonError::into_inner) = Some(head);
                }
                Err(err) => {
                    debug!(code = %err.code(), "request failed: {}", err.message());
                    shared.set_error(err);
                }
            }
            shared.ready.send_replace(true);
        });
    }
}

/// Receive half: waits for the request task and takes its response.
pub(crate) struct ResponseReader {
    ctx: CallContext,
    shared: Arc<Shared>,
}

impl ResponseReader {
    pub(crate) fn context(&self) -> &CallContext {
        &self.ctx
    }

    /// Wait until the response is known and take it. The head is empty when
    /// the request itself failed.
    pub(crate) async fn start(&self) -> (ResponseHead, Option<Error>) {
        tokio::select! {
            _ = self.shared.wait_ready() => {}
            err = self.ctx.done() => {
                self.shared.set_error(err);
            }
        }
        let head = self
            .shared
            .response
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .unwrap_or_default();
        (head, self.shared.error())
    }

    pub(crate) fn error(&self) -> Option<Error> {
        self.shared.error()
    }

    /// Record a failure seen while reading, so later sends fail fast.
    pub(crate) fn set_error(&self, err: Error) {
        self.shared.set_error(err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use http_body_util::Full;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Collects the whole request body and echoes it back.
    struct Echo {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl HttpClient for Echo {
        async fn request(&self, request: http::Request<Body>) -> Result<http::Response<Body>, Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let (parts, body) = request.into_parts();
            let data = body
                .collect()
                .await
                .map_err(|err| Error::from_boxed(Code::Unknown, err))?
                .to_bytes();
            let mut response =
                http::Response::new(Full::new(data).map_err(|never| match never {}).boxed_unsync());
            if let Some(timeout) = parts.headers.get(GRPC_TIMEOUT) {
                response.headers_mut().insert("x-timeout", timeout.clone());
            }
            Ok(response)
        }
    }

    struct Refuse;

    #[async_trait]
    impl HttpClient for Refuse {
        async fn request(&self, _request: http::Request<Body>) -> Result<http::Response<Body>, Error> {
            Err(Error::new(Code::Unavailable, "connection refused"))
        }
    }

    fn passthrough() -> Validate {
        Arc::new(|response: http::Response<Body>| {
            Box::pin(async move {
                let (parts, body) = response.into_parts();
                let head = ResponseHead {
                    header: parts.headers,
                    trailer: HeaderMap::new(),
                    body: Some(body),
                };
                (head, None)
            })
        })
    }

    fn uri() -> Uri {
        Uri::from_static("http://localhost/svc.S/M")
    }

    #[tokio::test]
    async fn test_send_then_receive() {
        let http = Arc::new(Echo {
            calls: AtomicUsize::new(0),
        });
        let (mut writer, reader) =
            duplex_call(CallContext::new(), http.clone(), uri(), passthrough());
        let header = HeaderMap::new();
        writer.send(&header, Bytes::from_static(b"one")).await.unwrap();
        writer.send(&header, Bytes::from_static(b"two")).await.unwrap();
        writer.close(&header);

        let (head, err) = reader.start().await;
        assert!(err.is_none());
        let body = head.body.unwrap().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"onetwo");
        assert_eq!(http.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_close_without_send_starts_request() {
        let http = Arc::new(Echo {
            calls: AtomicUsize::new(0),
        });
        let ctx = CallContext::new().with_timeout(std::time::Duration::from_secs(30));
        let (mut writer, reader) = duplex_call(ctx, http.clone(), uri(), passthrough());
        writer.close(&HeaderMap::new());
        let (head, err) = reader.start().await;
        assert!(err.is_none());
        assert!(head.header.contains_key("x-timeout"));
        assert_eq!(http.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_transport_failure_reaches_both_halves() {
        let (mut writer, reader) =
            duplex_call(CallContext::new(), Arc::new(Refuse), uri(), passthrough());
        let header = HeaderMap::new();
        // The first envelope fits in the channel; the failure surfaces later.
        let _ = writer.send(&header, Bytes::from_static(b"x")).await;
        let (_, err) = reader.start().await;
        assert_eq!(err.unwrap().code(), Code::Unavailable);
        let err = writer.send(&header, Bytes::from_static(b"y")).await.unwrap_err();
        assert_eq!(err.code(), Code::Unavailable);
    }

    #[tokio::test]
    async fn test_canceled_before_request() {
        let ctx = CallContext::new();
        ctx.cancel();
        let http = Arc::new(Echo {
            calls: AtomicUsize::new(0),
        });
        let (mut writer, reader) = duplex_call(ctx, http.clone(), uri(), passthrough());
        writer.close(&HeaderMap::new());
        let (_, err) = reader.start().await;
        assert_eq!(err.unwrap().code(), Code::Canceled);
        assert_eq!(http.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_send_after_close() {
        let http = Arc::new(Echo {
            calls: AtomicUsize::new(0),
        });
        let (mut writer, _reader) = duplex_call(CallContext::new(), http, uri(), passthrough());
        let header = HeaderMap::new();
        writer.close(&header);
        let err = writer.send(&header, Bytes::new()).await.unwrap_err();
        assert_eq!(err.code(), Code::FailedPrecondition);
    }
}
