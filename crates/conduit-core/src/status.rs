//! Mapping between [`Error`] and the gRPC status headers.
//!
//! On the wire an error is `grpc-status` (decimal code), `grpc-message`
//! (percent-encoded) and `grpc-status-details-bin` (a base64 `Status`
//! protobuf carrying the detail list). Success is an explicit `grpc-status: 0`.

use crate::code::Code;
use crate::error::Error;
use crate::header::{decode_binary_header, encode_binary_header, merge_headers, percent_decode, percent_encode};
use crate::protocol::{GRPC_MESSAGE, GRPC_STATUS, GRPC_STATUS_DETAILS_BIN};
use http::{HeaderMap, HeaderValue};
use prost::Message as _;

/// `google.rpc.Status`
#[derive(Clone, PartialEq, prost::Message)]
pub struct Status {
    #[prost(int32, tag = "1")]
    pub code: i32,
    #[prost(string, tag = "2")]
    pub message: String,
    #[prost(message, repeated, tag = "3")]
    pub details: Vec<prost_types::Any>,
}

impl From<&Error> for Status {
    fn from(err: &Error) -> Self {
        Self {
            code: err.code().as_u32() as i32,
            message: err.message().to_string(),
            details: err.details().to_vec(),
        }
    }
}

fn code_from_wire(value: i64) -> Code {
    u32::try_from(value)
        .ok()
        .and_then(Code::from_u32)
        .unwrap_or(Code::Unknown)
}

fn header_value(value: &str) -> HeaderValue {
    HeaderValue::from_str(value).unwrap_or_else(|_| HeaderValue::from_static(""))
}

/// Write the terminal status of a call into `trailer`.
///
/// `None` writes an explicit OK. An error also contributes its metadata.
pub fn error_to_trailer(trailer: &mut HeaderMap, err: Option<&Error>) {
    let Some(err) = err else {
        trailer.insert(GRPC_STATUS, HeaderValue::from_static("0"));
        trailer.insert(GRPC_MESSAGE, HeaderValue::from_static(""));
        return;
    };
    merge_headers(trailer, err.metadata());
    let status = Status::from(err);
    trailer.insert(GRPC_STATUS, HeaderValue::from(err.code().as_u32()));
    trailer.insert(GRPC_MESSAGE, header_value(&percent_encode(err.message())));
    let details = encode_binary_header(&status.encode_to_vec());
    trailer.insert(GRPC_STATUS_DETAILS_BIN, header_value(&details));
}

/// Read a terminal status from headers or trailers.
///
/// Returns `None` when the status is absent or `0`. When the details blob
/// decodes, its code and message take precedence over the plain headers.
pub fn error_from_trailer(trailer: &HeaderMap) -> Option<Error> {
    let code_header = trailer
        .get(GRPC_STATUS)
        .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned())
        .unwrap_or_default();
    if code_header.is_empty() || code_header == "0" {
        return None;
    }
    let Ok(code) = code_header.parse::<u32>() else {
        return Some(Error::new(
            Code::Unknown,
            format!("protocol error: got invalid error code {code_header:?}"),
        ));
    };
    let message = trailer
        .get(GRPC_MESSAGE)
        .map(|value| percent_decode(&String::from_utf8_lossy(value.as_bytes())))
        .unwrap_or_default();
    let err = Error::new(code_from_wire(i64::from(code)), message);

    let details = trailer
        .get(GRPC_STATUS_DETAILS_BIN)
        .map(|value| value.as_bytes())
        .unwrap_or_default();
    if details.is_empty() {
        return Some(err);
    }
    let binary = match std::str::from_utf8(details)
        .map_err(|e| e.to_string())
        .and_then(|text| decode_binary_header(text).map_err(|e| e.to_string()))
    {
        Ok(binary) => binary,
        Err(reason) => {
            return Some(Error::new(
                Code::Unknown,
                format!("server returned invalid grpc-status-details-bin trailer: {reason}"),
            ));
        }
    };
    let status = match Status::decode(binary.as_slice()) {
        Ok(status) => status,
        Err(reason) => {
            return Some(Error::new(
                Code::Unknown,
                format!("server returned invalid protobuf for error details: {reason}"),
            ));
        }
    };
    let mut err = Error::new(code_from_wire(i64::from(status.code)), status.message);
    err.set_details(status.details);
    Some(err)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(err: &Error) -> Error {
        let mut trailer = HeaderMap::new();
        error_to_trailer(&mut trailer, Some(err));
        error_from_trailer(&trailer).expect("error status")
    }

    #[test]
    fn test_ok_is_explicit() {
        let mut trailer = HeaderMap::new();
        error_to_trailer(&mut trailer, None);
        assert_eq!(trailer.get(GRPC_STATUS).unwrap(), "0");
        assert!(error_from_trailer(&trailer).is_none());
        assert!(error_from_trailer(&HeaderMap::new()).is_none());
    }

    #[test]
    fn test_every_code_round_trips() {
        for code in Code::ALL.into_iter().filter(|c| *c != Code::Ok) {
            let err = Error::new(code, format!("failed with {code}: ünïcode 100%"));
            let back = round_trip(&err);
            assert_eq!(back.code(), code);
            assert_eq!(back.message(), err.message());
        }
    }

    #[test]
    fn test_details_and_metadata() {
        let mut err = Error::new(Code::ResourceExhausted, "slow down");
        err.add_detail(&prost_types::Duration { seconds: 30, nanos: 0 }).unwrap();
        err.metadata_mut().insert("x-retry-shard", HeaderValue::from_static("7"));
        let mut trailer = HeaderMap::new();
        error_to_trailer(&mut trailer, Some(&err));
        assert_eq!(trailer.get("x-retry-shard").unwrap(), "7");

        let back = error_from_trailer(&trailer).unwrap();
        let retry: prost_types::Duration = back.find_detail().unwrap();
        assert_eq!(retry.seconds, 30);
    }

    #[test]
    fn test_details_override_plain_headers() {
        let status = Status {
            code: Code::NotFound.as_u32() as i32,
            message: "from details".to_string(),
            details: Vec::new(),
        };
        let mut trailer = HeaderMap::new();
        trailer.insert(GRPC_STATUS, HeaderValue::from_static("13"));
        trailer.insert(GRPC_MESSAGE, HeaderValue::from_static("from header"));
        trailer.insert(
            GRPC_STATUS_DETAILS_BIN,
            header_value(&encode_binary_header(&status.encode_to_vec())),
        );
        let err = error_from_trailer(&trailer).unwrap();
        assert_eq!(err.code(), Code::NotFound);
        assert_eq!(err.message(), "from details");
    }

    #[test]
    fn test_invalid_code() {
        let mut trailer = HeaderMap::new();
        trailer.insert(GRPC_STATUS, HeaderValue::from_static("nope"));
        assert_eq!(error_from_trailer(&trailer).unwrap().code(), Code::Unknown);

        trailer.insert(GRPC_STATUS, HeaderValue::from_static("99"));
        assert_eq!(error_from_trailer(&trailer).unwrap().code(), Code::Unknown);
    }

    #[test]
    fn test_garbled_details() {
        let mut trailer = HeaderMap::new();
        trailer.insert(GRPC_STATUS, HeaderValue::from_static("3"));
        trailer.insert(GRPC_STATUS_DETAILS_BIN, HeaderValue::from_static("!!!"));
        let err = error_from_trailer(&trailer).unwrap();
        assert_eq!(err.code(), Code::Unknown);
        assert!(err.message().contains("grpc-status-details-bin"));
    }
}
