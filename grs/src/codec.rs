use axum::http::header::CONTENT_TYPE;
use axum::http::HeaderMap;
use serde::de::DeserializeOwned;
use serde::Serialize;

pub const APPLICATION_JSON: &str = "application/json";

/// Wire codec, dispatched on the request's Content-Type. A closed sum: JSON
/// is the default, anything else selects the Protobuf arm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Json,
    // TODO: back this arm with a real protobuf codec; until then it falls
    // back to JSON.
    Protobuf,
}

impl Codec {
    /// An absent or JSON Content-Type selects JSON, any other value selects
    /// Protobuf.
    pub fn negotiate(headers: &HeaderMap) -> Codec {
        match headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok()) {
            None => Codec::Json,
            Some(content_type) if content_type.starts_with(APPLICATION_JSON) => Codec::Json,
            Some(_) => Codec::Protobuf,
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Codec::Json | Codec::Protobuf => APPLICATION_JSON,
        }
    }

    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, serde_json::Error> {
        match self {
            Codec::Json | Codec::Protobuf => serde_json::to_vec(value),
        }
    }

    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, serde_json::Error> {
        match self {
            Codec::Json | Codec::Protobuf => serde_json::from_slice(bytes),
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn negotiation_defaults_to_json() {
        let headers = HeaderMap::new();
        assert_eq!(Codec::negotiate(&headers), Codec::Json);

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        assert_eq!(Codec::negotiate(&headers), Codec::Json);

        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/json; charset=utf-8"),
        );
        assert_eq!(Codec::negotiate(&headers), Codec::Json);

        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/vnd.google.protobuf"),
        );
        assert_eq!(Codec::negotiate(&headers), Codec::Protobuf);
    }
}
