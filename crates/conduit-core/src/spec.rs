//! Call descriptors.

/// Streaming shape of a procedure, as two directional flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamType(u8);

impl StreamType {
    pub const UNARY: StreamType = StreamType(0);
    pub const CLIENT: StreamType = StreamType(0b01);
    pub const SERVER: StreamType = StreamType(0b10);
    pub const BIDI: StreamType = StreamType(0b11);

    /// The client sends more than one message.
    pub fn is_client_streaming(&self) -> bool {
        self.0 & Self::CLIENT.0 != 0
    }

    /// The server sends more than one message.
    pub fn is_server_streaming(&self) -> bool {
        self.0 & Self::SERVER.0 != 0
    }

    pub fn is_bidi(&self) -> bool {
        self.0 & Self::BIDI.0 == Self::BIDI.0
    }
}

/// Immutable description of one call, shared by both halves of its stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Specification {
    /// `package.Service/Method`
    pub procedure: String,
    pub stream_type: StreamType,
    /// True on the calling side, false inside a handler.
    pub is_client: bool,
}

impl Specification {
    pub fn new(procedure: impl Into<String>, stream_type: StreamType, is_client: bool) -> Self {
        Self {
            procedure: procedure.into(),
            stream_type,
            is_client,
        }
    }

    /// `package.Service` part of the procedure
    pub fn service(&self) -> &str {
        self.procedure
            .rsplit_once('/')
            .map(|(service, _)| service.trim_start_matches('/'))
            .unwrap_or("")
    }

    pub fn method(&self) -> &str {
        self.procedure
            .rsplit_once('/')
            .map(|(_, method)| method)
            .unwrap_or(&self.procedure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_type_flags() {
        assert!(!StreamType::UNARY.is_client_streaming());
        assert!(!StreamType::UNARY.is_server_streaming());
        assert!(StreamType::CLIENT.is_client_streaming());
        assert!(!StreamType::CLIENT.is_bidi());
        assert!(StreamType::SERVER.is_server_streaming());
        assert!(StreamType::BIDI.is_client_streaming());
        assert!(StreamType::BIDI.is_server_streaming());
        assert!(StreamType::BIDI.is_bidi());
    }

    #[test]
    fn test_procedure_parts() {
        let spec = Specification::new("ping.v1.PingService/Ping", StreamType::UNARY, true);
        assert_eq!(spec.service(), "ping.v1.PingService");
        assert_eq!(spec.method(), "Ping");
    }
}
