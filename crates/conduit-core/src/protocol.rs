//! gRPC and gRPC-Web protocol constants.
//!
//! The two variants share everything except trailer delivery and the
//! content-type prefix, so a single [`Protocol`] value selects between them.

use crate::codec::CODEC_NAME_PROTO;
use http::header::HeaderName;

pub const GRPC_STATUS: HeaderName = HeaderName::from_static("grpc-status");
pub const GRPC_MESSAGE: HeaderName = HeaderName::from_static("grpc-message");
pub const GRPC_STATUS_DETAILS_BIN: HeaderName = HeaderName::from_static("grpc-status-details-bin");
pub const GRPC_ENCODING: HeaderName = HeaderName::from_static("grpc-encoding");
pub const GRPC_ACCEPT_ENCODING: HeaderName = HeaderName::from_static("grpc-accept-encoding");
pub const GRPC_TIMEOUT: HeaderName = HeaderName::from_static("grpc-timeout");
pub const ACCEPT_POST: HeaderName = HeaderName::from_static("accept-post");

const GRPC_CONTENT_TYPE: &str = "application/grpc";
const GRPC_WEB_CONTENT_TYPE: &str = "application/grpc-web";

/// Wire protocol variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Grpc,
    GrpcWeb,
}

impl Protocol {
    pub fn is_web(&self) -> bool {
        matches!(self, Protocol::GrpcWeb)
    }

    fn base_content_type(&self) -> &'static str {
        match self {
            Protocol::Grpc => GRPC_CONTENT_TYPE,
            Protocol::GrpcWeb => GRPC_WEB_CONTENT_TYPE,
        }
    }

    /// Content type announcing `codec`, always in the explicit `+name` form.
    pub fn content_type(&self, codec: &str) -> String {
        format!("{}+{}", self.base_content_type(), codec)
    }

    /// Codec named by a request content type, or `None` if the content type
    /// does not belong to this variant. The bare form means protobuf.
    pub fn codec_from_content_type<'a>(&self, content_type: &'a str) -> Option<&'a str> {
        let base = self.base_content_type();
        let rest = content_type.strip_prefix(base)?;
        if rest.is_empty() {
            return Some(CODEC_NAME_PROTO);
        }
        rest.strip_prefix('+').filter(|name| !name.is_empty())
    }

    /// Content types this variant accepts for the given codec names.
    pub fn accepted_content_types(&self, codecs: &[String]) -> Vec<String> {
        let mut types = Vec::with_capacity(codecs.len() + 1);
        if codecs.iter().any(|name| name == CODEC_NAME_PROTO) {
            types.push(self.base_content_type().to_string());
        }
        types.extend(codecs.iter().map(|name| self.content_type(name)));
        types
    }
}

/// `user-agent` sent by clients.
pub fn user_agent() -> String {
    format!("grpc-rust-conduit/{}", env!("CARGO_PKG_VERSION"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_types() {
        assert_eq!(Protocol::Grpc.content_type("proto"), "application/grpc+proto");
        assert_eq!(Protocol::GrpcWeb.content_type("json"), "application/grpc-web+json");
    }

    #[test]
    fn test_codec_from_content_type() {
        let grpc = Protocol::Grpc;
        assert_eq!(grpc.codec_from_content_type("application/grpc"), Some("proto"));
        assert_eq!(grpc.codec_from_content_type("application/grpc+json"), Some("json"));
        assert_eq!(grpc.codec_from_content_type("application/grpc+"), None);
        assert_eq!(grpc.codec_from_content_type("application/grpc-web"), None);
        assert_eq!(grpc.codec_from_content_type("application/json"), None);

        let web = Protocol::GrpcWeb;
        assert_eq!(web.codec_from_content_type("application/grpc-web"), Some("proto"));
        assert_eq!(web.codec_from_content_type("application/grpc-web+proto"), Some("proto"));
        assert_eq!(web.codec_from_content_type("application/grpc+proto"), None);
    }

    #[test]
    fn test_accepted_content_types() {
        let codecs = vec!["proto".to_string(), "json".to_string()];
        assert_eq!(
            Protocol::Grpc.accepted_content_types(&codecs),
            vec![
                "application/grpc".to_string(),
                "application/grpc+proto".to_string(),
                "application/grpc+json".to_string(),
            ]
        );
    }

    #[test]
    fn test_user_agent() {
        assert!(user_agent().starts_with("grpc-rust-conduit/"));
    }
}
