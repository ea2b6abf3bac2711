//! Error model shared by clients and handlers.

use crate::code::Code;
use http::HeaderMap;
use prost_types::Any;
use std::fmt;
use std::sync::Arc;

/// Boxed error used at transport seams.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// An RPC error: a code, a message, typed details and wire metadata.
///
/// Metadata is populated when the error crosses the wire: handlers merge it
/// into the trailers they send, and clients fill it with the response headers
/// and trailers the error was parsed from.
#[derive(Clone)]
pub struct Error {
    code: Code,
    message: String,
    details: Vec<Any>,
    metadata: HeaderMap,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
    end_of_stream: bool,
}

impl Error {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: Vec::new(),
            metadata: HeaderMap::new(),
            source: None,
            end_of_stream: false,
        }
    }

    /// Wrap an underlying error, using its display text as the message.
    pub fn from_source<E>(code: Code, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self {
            code,
            message: source.to_string(),
            details: Vec::new(),
            metadata: HeaderMap::new(),
            source: Some(Arc::new(source)),
            end_of_stream: false,
        }
    }

    /// Wrap a boxed transport error.
    pub fn from_boxed(code: Code, source: BoxError) -> Self {
        Self {
            code,
            message: source.to_string(),
            details: Vec::new(),
            metadata: HeaderMap::new(),
            source: Some(Arc::from(source)),
            end_of_stream: false,
        }
    }

    pub fn canceled() -> Self {
        Self::new(Code::Canceled, "call canceled")
    }

    pub fn deadline_exceeded() -> Self {
        Self::new(Code::DeadlineExceeded, "deadline exceeded")
    }

    /// Returned by `send` once the peer has stopped reading. The call's real
    /// outcome is available from the receiving half.
    pub fn end_of_stream() -> Self {
        Self {
            end_of_stream: true,
            ..Self::new(Code::Unknown, "stream closed by peer")
        }
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.end_of_stream
    }

    pub fn code(&self) -> Code {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn details(&self) -> &[Any] {
        &self.details
    }

    /// Append a typed detail message.
    pub fn add_detail<M: prost::Name>(&mut self, detail: &M) -> Result<(), Error> {
        let any = Any::from_msg(detail)
            .map_err(|err| Error::from_source(Code::Internal, err))?;
        self.details.push(any);
        Ok(())
    }

    /// Replace the detail list with pre-encoded messages.
    pub fn set_details(&mut self, details: Vec<Any>) {
        self.details = details;
    }

    /// Decode the first detail whose type matches `M`.
    pub fn find_detail<M: prost::Name + Default>(&self) -> Option<M> {
        self.details.iter().find_map(|any| any.to_msg::<M>().ok())
    }

    pub fn metadata(&self) -> &HeaderMap {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut HeaderMap {
        &mut self.metadata
    }

    pub fn with_metadata(mut self, metadata: HeaderMap) -> Self {
        self.metadata = metadata;
        self
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Error")
            .field("code", &self.code)
            .field("message", &self.message)
            .field("details", &self.details.len())
            .field("metadata", &self.metadata)
            .finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{}: {}", self.code, self.message)
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|err| err as &(dyn std::error::Error + 'static))
    }
}

impl From<prost::EncodeError> for Error {
    fn from(err: prost::EncodeError) -> Self {
        Error::from_source(Code::Internal, err)
    }
}

impl From<prost::DecodeError> for Error {
    fn from(err: prost::DecodeError) -> Self {
        Error::from_source(Code::InvalidArgument, err)
    }
}

/// The code of any error: the RPC code for an [`Error`], `Unknown` otherwise.
pub fn code_of(err: &(dyn std::error::Error + 'static)) -> Code {
    match err.downcast_ref::<Error>() {
        Some(err) => err.code(),
        None => Code::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = Error::new(Code::NotFound, "no such user");
        assert_eq!(err.to_string(), "not_found: no such user");
        let bare = Error::new(Code::Aborted, "");
        assert_eq!(bare.to_string(), "aborted");
    }

    #[test]
    fn test_code_of() {
        let err = Error::new(Code::Unavailable, "down");
        assert_eq!(code_of(&err), Code::Unavailable);
        let io = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        assert_eq!(code_of(&io), Code::Unknown);
    }

    #[test]
    fn test_from_source_keeps_chain() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let err = Error::from_source(Code::Unavailable, io);
        assert_eq!(err.message(), "pipe closed");
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_details() {
        let mut err = Error::new(Code::FailedPrecondition, "bad state");
        err.add_detail(&prost_types::Duration {
            seconds: 5,
            nanos: 0,
        })
        .unwrap();
        assert_eq!(err.details().len(), 1);
        let duration: prost_types::Duration = err.find_detail().unwrap();
        assert_eq!(duration.seconds, 5);
        assert!(err.find_detail::<prost_types::Timestamp>().is_none());
    }
}
