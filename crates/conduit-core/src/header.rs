//! Header helpers: percent-encoded messages, binary (`-bin`) values, header
//! validation and the gRPC-Web trailer block.

use crate::code::Code;
use crate::error::Error;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine;
use bytes::{BufMut, Bytes, BytesMut};
use http::header::{HeaderMap, HeaderName, HeaderValue};

/// Header validation and parsing errors
#[derive(Debug, thiserror::Error)]
pub enum HeaderError {
    #[error("empty header key")]
    EmptyKey,

    #[error("{0:?} is a reserved HTTP/2 pseudo-header")]
    PseudoHeader(String),

    #[error("{0:?} contains non-ASCII or reserved characters")]
    InvalidKey(String),

    #[error("{0:?} is a reserved header")]
    Reserved(String),

    #[error("{0:?} is reserved for the gRPC protocol")]
    ReservedForProtocol(String),

    #[error("header value has a non-printable byte at index {0}")]
    InvalidValue(usize),

    #[error("invalid binary header: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("invalid trailer line {0:?}")]
    MalformedTrailer(String),
}

impl From<HeaderError> for Error {
    fn from(err: HeaderError) -> Self {
        Error::from_source(Code::InvalidArgument, err)
    }
}

const RESERVED_KEYS: &[&str] = &[
    "accept",
    "accept-encoding",
    "accept-post",
    "allow",
    "content-encoding",
    "content-type",
    "origin",
    "te",
    "trailer",
];

/// Check that an application may set `key`.
///
/// Keys owned by HTTP semantics or by the gRPC protocol itself are rejected.
pub fn validate_header_key(key: &str) -> Result<(), HeaderError> {
    if key.is_empty() {
        return Err(HeaderError::EmptyKey);
    }
    if key.starts_with(':') {
        return Err(HeaderError::PseudoHeader(key.to_string()));
    }
    let valid_chars = key
        .bytes()
        .all(|c| c.is_ascii_alphanumeric() || c == b'-' || c == b'_' || c == b'.');
    if !valid_chars {
        return Err(HeaderError::InvalidKey(key.to_string()));
    }
    let lower = key.to_ascii_lowercase();
    if RESERVED_KEYS.contains(&lower.as_str()) || lower.starts_with("access-control") {
        return Err(HeaderError::Reserved(key.to_string()));
    }
    if lower.starts_with("grpc-") {
        return Err(HeaderError::ReservedForProtocol(key.to_string()));
    }
    Ok(())
}

/// Check that every byte of `value` is a space or printable ASCII.
pub fn validate_header_value(value: &str) -> Result<(), HeaderError> {
    match value.bytes().position(|c| !(0x20..=0x7E).contains(&c)) {
        Some(index) => Err(HeaderError::InvalidValue(index)),
        None => Ok(()),
    }
}

/// Base64-encode a binary header value without padding.
pub fn encode_binary_header(data: &[u8]) -> String {
    STANDARD_NO_PAD.encode(data)
}

/// Decode a binary header value, padded or not.
pub fn decode_binary_header(value: &str) -> Result<Vec<u8>, HeaderError> {
    if value.len() % 4 != 0 {
        Ok(STANDARD_NO_PAD.decode(value)?)
    } else {
        Ok(STANDARD.decode(value)?)
    }
}

fn needs_escape(c: u8) -> bool {
    !(b' '..=b'~').contains(&c) || c == b'%'
}

/// Percent-encode a status message for `grpc-message`.
pub fn percent_encode(message: &str) -> String {
    let bytes = message.as_bytes();
    let Some(first) = bytes.iter().position(|&c| needs_escape(c)) else {
        return message.to_string();
    };
    let mut out = String::with_capacity(bytes.len() + 16);
    out.push_str(&message[..first]);
    for &c in &bytes[first..] {
        if needs_escape(c) {
            out.push_str(&format!("%{:02X}", c));
        } else {
            out.push(c as char);
        }
    }
    out
}

/// Decode a `grpc-message` value.
///
/// Malformed escapes decode to U+FFFD rather than failing, and invalid UTF-8
/// in the decoded bytes is replaced the same way.
pub fn percent_decode(encoded: &str) -> String {
    let bytes = encoded.as_bytes();
    if !bytes.contains(&b'%') {
        return encoded.to_string();
    }
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        if c != b'%' || i + 2 >= bytes.len() {
            out.push(c);
            i += 1;
            continue;
        }
        let hex = std::str::from_utf8(&bytes[i + 1..i + 3])
            .ok()
            .and_then(|digits| u8::from_str_radix(digits, 16).ok());
        match hex {
            Some(byte) => out.push(byte),
            None => out.extend_from_slice(char::REPLACEMENT_CHARACTER.to_string().as_bytes()),
        }
        i += 3;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Append every value of `from` into `into`.
pub fn merge_headers(into: &mut HeaderMap, from: &HeaderMap) {
    for (name, value) in from {
        into.append(name.clone(), value.clone());
    }
}

/// Checked access to application metadata stored in a [`HeaderMap`].
pub trait MetadataExt {
    /// First value of `key` as text, if present and visible ASCII.
    fn get_text(&self, key: &str) -> Option<&str>;

    /// Decoded value of the binary header `key` (without the `-bin` suffix).
    fn get_binary(&self, key: &str) -> Result<Option<Vec<u8>>, HeaderError>;

    /// Replace `key` after validating both key and value.
    fn set_text(&mut self, key: &str, value: &str) -> Result<(), HeaderError>;

    /// Append a value to `key` after validating both key and value.
    fn add_text(&mut self, key: &str, value: &str) -> Result<(), HeaderError>;

    /// Store `value` base64-encoded under `key-bin`.
    fn set_binary(&mut self, key: &str, value: &[u8]) -> Result<(), HeaderError>;
}

fn checked_pair(key: &str, value: &str) -> Result<(HeaderName, HeaderValue), HeaderError> {
    validate_header_key(key)?;
    validate_header_value(value)?;
    let name = HeaderName::from_bytes(key.as_bytes())
        .map_err(|_| HeaderError::InvalidKey(key.to_string()))?;
    let value = HeaderValue::from_str(value).map_err(|_| HeaderError::InvalidValue(0))?;
    Ok((name, value))
}

impl MetadataExt for HeaderMap {
    fn get_text(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(|value| value.to_str().ok())
    }

    fn get_binary(&self, key: &str) -> Result<Option<Vec<u8>>, HeaderError> {
        match self.get_text(&format!("{key}-bin")) {
            Some(value) => decode_binary_header(value).map(Some),
            None => Ok(None),
        }
    }

    fn set_text(&mut self, key: &str, value: &str) -> Result<(), HeaderError> {
        let (name, value) = checked_pair(key, value)?;
        self.insert(name, value);
        Ok(())
    }

    fn add_text(&mut self, key: &str, value: &str) -> Result<(), HeaderError> {
        let (name, value) = checked_pair(key, value)?;
        self.append(name, value);
        Ok(())
    }

    fn set_binary(&mut self, key: &str, value: &[u8]) -> Result<(), HeaderError> {
        let (name, value) = checked_pair(&format!("{key}-bin"), &encode_binary_header(value))?;
        self.insert(name, value);
        Ok(())
    }
}

/// Serialize trailers as the HTTP/1 header block carried in a gRPC-Web
/// trailer envelope.
pub fn encode_trailer_block(trailers: &HeaderMap) -> Bytes {
    let mut buf = BytesMut::new();
    for (name, value) in trailers {
        buf.put_slice(name.as_str().as_bytes());
        buf.put_slice(b": ");
        buf.put_slice(value.as_bytes());
        buf.put_slice(b"\r\n");
    }
    buf.freeze()
}

fn trim(mut bytes: &[u8]) -> &[u8] {
    while let [first, rest @ ..] = bytes {
        if !first.is_ascii_whitespace() {
            break;
        }
        bytes = rest;
    }
    while let [rest @ .., last] = bytes {
        if !last.is_ascii_whitespace() {
            break;
        }
        bytes = rest;
    }
    bytes
}

/// Parse a gRPC-Web trailer block.
///
/// The final line may omit its terminator, and bare `\n` line endings are
/// accepted.
pub fn parse_trailer_block(block: &[u8]) -> Result<HeaderMap, HeaderError> {
    let mut trailers = HeaderMap::new();
    for line in block.split(|&c| c == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.is_empty() {
            continue;
        }
        let malformed = || HeaderError::MalformedTrailer(String::from_utf8_lossy(line).into_owned());
        let colon = line.iter().position(|&c| c == b':').ok_or_else(malformed)?;
        let name = HeaderName::from_bytes(trim(&line[..colon])).map_err(|_| malformed())?;
        let value = HeaderValue::from_bytes(trim(&line[colon + 1..])).map_err(|_| malformed())?;
        trailers.append(name, value);
    }
    Ok(trailers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_percent_encode() {
        assert_eq!(percent_encode("hello world"), "hello world");
        assert_eq!(percent_encode("100%"), "100%25");
        assert_eq!(percent_encode("line\nbreak"), "line%0Abreak");
        assert_eq!(percent_encode("ü"), "%C3%BC");
    }

    #[test]
    fn test_percent_decode_malformed() {
        assert_eq!(percent_decode("%zzok"), "\u{FFFD}ok");
        // Too short to be an escape.
        assert_eq!(percent_decode("50%"), "50%");
        assert_eq!(percent_decode("%4"), "%4");
        assert_eq!(percent_decode("%41%42"), "AB");
    }

    #[test]
    fn test_binary_header_padding() {
        assert_eq!(encode_binary_header(b"a"), "YQ");
        assert_eq!(decode_binary_header("YQ").unwrap(), b"a");
        assert_eq!(decode_binary_header("YQ==").unwrap(), b"a");
        assert!(decode_binary_header("!!!").is_err());
    }

    #[test]
    fn test_validate_header_key() {
        assert!(validate_header_key("x-request-id").is_ok());
        assert!(validate_header_key("").is_err());
        assert!(validate_header_key(":path").is_err());
        assert!(validate_header_key("Content-Type").is_err());
        assert!(validate_header_key("grpc-status").is_err());
        assert!(validate_header_key("access-control-allow-origin").is_err());
        assert!(validate_header_key("bad key").is_err());
    }

    #[test]
    fn test_metadata_ext() {
        let mut headers = HeaderMap::new();
        headers.set_text("x-user", "alice").unwrap();
        headers.add_text("x-user", "bob").unwrap();
        headers.set_binary("x-blob", &[0, 1, 2, 255]).unwrap();
        assert_eq!(headers.get_text("x-user"), Some("alice"));
        assert_eq!(headers.get_all("x-user").iter().count(), 2);
        assert_eq!(headers.get_binary("x-blob").unwrap().unwrap(), vec![0, 1, 2, 255]);
        assert!(headers.get_binary("x-missing").unwrap().is_none());
        assert!(headers.set_text("te", "trailers").is_err());
        assert!(headers.set_text("x-ok", "tab\tnot allowed").is_err());
    }

    #[test]
    fn test_trailer_block() {
        let mut trailers = HeaderMap::new();
        trailers.insert("grpc-status", HeaderValue::from_static("0"));
        trailers.append("x-multi", HeaderValue::from_static("one"));
        trailers.append("x-multi", HeaderValue::from_static("two"));
        let block = encode_trailer_block(&trailers);
        let parsed = parse_trailer_block(&block).unwrap();
        assert_eq!(parsed.get("grpc-status").unwrap(), "0");
        assert_eq!(parsed.get_all("x-multi").iter().count(), 2);

        let loose = parse_trailer_block(b"Grpc-Status: 3\ngrpc-message:  bad ").unwrap();
        assert_eq!(loose.get("grpc-status").unwrap(), "3");
        assert_eq!(loose.get("grpc-message").unwrap(), "bad");

        assert!(parse_trailer_block(b"no colon here").is_err());
    }

    proptest! {
        #[test]
        fn prop_percent_round_trip(s in "\\PC*") {
            prop_assert_eq!(percent_decode(&percent_encode(&s)), s);
        }

        #[test]
        fn prop_binary_header_round_trip(data in proptest::collection::vec(any::<u8>(), 0..256)) {
            let unpadded = encode_binary_header(&data);
            prop_assert_eq!(decode_binary_header(&unpadded).unwrap(), data.clone());
            let padded = STANDARD.encode(&data);
            prop_assert_eq!(decode_binary_header(&padded).unwrap(), data);
        }
    }
}
