//! Ping service used to exercise conduit end to end
//!
//! Covers every call shape: `Ping` and `Fail` are unary, `Sum` streams
//! requests, `CountUp` streams responses and `CumSum` streams both ways.
//! Messages are declared with `prost` derives rather than generated.

use conduit_core::{CallContext, Code, Error, Request, Response};
use conduit_server::{BidiStream, ClientStream, Handler, HandlerBuilder, Server, ServerStream};
use futures_util::future::{BoxFuture, FutureExt};
use http::HeaderValue;
use tracing::debug;

pub mod v1 {
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct PingRequest {
        #[prost(int64, tag = "1")]
        pub number: i64,
        #[prost(string, tag = "2")]
        pub text: String,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct PingResponse {
        #[prost(int64, tag = "1")]
        pub number: i64,
        #[prost(string, tag = "2")]
        pub text: String,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct FailRequest {
        /// gRPC status code to fail with.
        #[prost(int32, tag = "1")]
        pub code: i32,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct FailResponse {}

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct SumRequest {
        #[prost(int64, tag = "1")]
        pub number: i64,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct SumResponse {
        #[prost(int64, tag = "1")]
        pub sum: i64,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct CountUpRequest {
        #[prost(int64, tag = "1")]
        pub number: i64,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct CountUpResponse {
        #[prost(int64, tag = "1")]
        pub number: i64,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct CumSumRequest {
        #[prost(int64, tag = "1")]
        pub number: i64,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct CumSumResponse {
        #[prost(int64, tag = "1")]
        pub sum: i64,
    }

    /// Attached to errors returned by `Fail`.
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct FailureDetail {
        #[prost(string, tag = "1")]
        pub reason: String,
    }

    impl prost::Name for FailureDetail {
        const NAME: &'static str = "FailureDetail";
        const PACKAGE: &'static str = "acme.ping.v1";
    }
}

use v1::*;

pub const SERVICE_NAME: &str = "acme.ping.v1.PingService";
pub const PING_PROCEDURE: &str = "acme.ping.v1.PingService/Ping";
pub const FAIL_PROCEDURE: &str = "acme.ping.v1.PingService/Fail";
pub const SUM_PROCEDURE: &str = "acme.ping.v1.PingService/Sum";
pub const COUNT_UP_PROCEDURE: &str = "acme.ping.v1.PingService/CountUp";
pub const CUM_SUM_PROCEDURE: &str = "acme.ping.v1.PingService/CumSum";

/// Request header echoed back by `Ping` as a response header and trailer.
pub const ECHO_HEADER: &str = "x-echo";
/// Response header reporting the number of requests `Sum` read.
pub const COUNT_HEADER: &str = "x-count";
/// Response header carrying the milliseconds left before the deadline.
pub const REMAINING_HEADER: &str = "x-remaining-ms";
/// Metadata attached to errors returned by `Fail`.
pub const FAIL_METADATA: &str = "x-fail";

/// Echo the request, reflecting `x-echo` and the remaining deadline.
pub async fn ping(ctx: CallContext, request: Request<PingRequest>) -> Result<Response<PingResponse>, Error> {
    let echo = request.header().get(ECHO_HEADER).cloned();
    let message = request.into_message();
    let mut response = Response::new(PingResponse {
        number: message.number,
        text: message.text,
    });
    if let Some(echo) = echo {
        response.header_mut().insert(ECHO_HEADER, echo.clone());
        response.trailer_mut().insert(ECHO_HEADER, echo);
    }
    if let Some(remaining) = ctx.remaining() {
        response
            .header_mut()
            .insert(REMAINING_HEADER, HeaderValue::from(remaining.as_millis() as u64));
    }
    Ok(response)
}

/// Fail with the requested code, one detail and some metadata.
pub async fn fail(_ctx: CallContext, request: Request<FailRequest>) -> Result<Response<FailResponse>, Error> {
    let code = u32::try_from(request.message().code)
        .ok()
        .and_then(Code::from_u32)
        .unwrap_or(Code::Unknown);
    let mut err = Error::new(code, "fail requested");
    err.add_detail(&FailureDetail {
        reason: format!("asked to fail with {code}"),
    })?;
    err.metadata_mut()
        .insert(FAIL_METADATA, HeaderValue::from_static("yes"));
    Err(err)
}

/// Add up every request.
pub fn sum<'a>(
    _ctx: CallContext,
    stream: &'a mut ClientStream<SumRequest>,
) -> BoxFuture<'a, Result<Response<SumResponse>, Error>> {
    async move {
        let mut sum = 0i64;
        let mut count = 0u64;
        while let Some(request) = stream.receive().await? {
            sum += request.number;
            count += 1;
        }
        debug!(count, sum, "sum complete");
        let mut response = Response::new(SumResponse { sum });
        response
            .header_mut()
            .insert(COUNT_HEADER, HeaderValue::from(count));
        Ok(response)
    }
    .boxed()
}

/// Stream 1 through the requested number.
pub fn count_up<'a>(
    _ctx: CallContext,
    request: Request<CountUpRequest>,
    stream: &'a mut ServerStream<CountUpResponse>,
) -> BoxFuture<'a, Result<(), Error>> {
    async move {
        let number = request.message().number;
        if number <= 0 {
            return Err(Error::new(
                Code::InvalidArgument,
                format!("number must be positive: got {number}"),
            ));
        }
        for i in 1..=number {
            stream.send(&CountUpResponse { number: i }).await?;
        }
        Ok(())
    }
    .boxed()
}

/// Reply to each request with the running total.
pub fn cum_sum<'a>(
    _ctx: CallContext,
    stream: &'a mut BidiStream<CumSumRequest, CumSumResponse>,
) -> BoxFuture<'a, Result<(), Error>> {
    async move {
        let mut sum = 0i64;
        while let Some(request) = stream.receive().await? {
            sum += request.number;
            stream.send(&CumSumResponse { sum }).await?;
        }
        Ok(())
    }
    .boxed()
}

/// Handlers for every procedure, each built from a builder passed
/// through `configure`.
pub fn handlers<F>(configure: F) -> Vec<Handler>
where
    F: Fn(HandlerBuilder) -> HandlerBuilder,
{
    vec![
        configure(Handler::builder(PING_PROCEDURE)).unary(ping),
        configure(Handler::builder(FAIL_PROCEDURE)).unary(fail),
        configure(Handler::builder(SUM_PROCEDURE)).client_stream(sum),
        configure(Handler::builder(COUNT_UP_PROCEDURE)).server_stream(count_up),
        configure(Handler::builder(CUM_SUM_PROCEDURE)).bidi_stream(cum_sum),
    ]
}

/// Server exposing the ping service.
pub fn server<F>(configure: F) -> Server
where
    F: Fn(HandlerBuilder) -> HandlerBuilder,
{
    handlers(configure)
        .into_iter()
        .fold(Server::builder(), |builder, handler| builder.register(handler))
        .build()
}
