//! Pluggable payload serialization.
//!
//! The [`MessageCodec`] trait lets callers bring their own serialization
//! format for request and response payloads; [`JsonCodec`] is the provided
//! default. The retry invoker encodes a request exactly once, before the
//! first attempt, and replays the same bytes on every retry.

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use buslink_core::ChannelError;

/// Errors raised while encoding or decoding a payload.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Failed to encode a message to bytes.
    #[error("encode failed: {0}")]
    Encode(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Failed to decode bytes to a message.
    #[error("decode failed: {0}")]
    Decode(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl From<CodecError> for ChannelError {
    fn from(error: CodecError) -> Self {
        ChannelError::Codec {
            message: error.to_string(),
        }
    }
}

/// Pluggable message serialization format.
pub trait MessageCodec: Clone + 'static {
    /// Encode a serializable message to bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Encode`] if serialization fails.
    fn encode<T: Serialize>(&self, msg: &T) -> Result<Vec<u8>, CodecError>;

    /// Decode bytes to a deserializable message.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Decode`] if deserialization fails.
    fn decode<T: DeserializeOwned>(&self, buf: &[u8]) -> Result<T, CodecError>;
}

/// JSON codec using serde_json. Human-readable, handy for debugging.
#[derive(Clone, Default, Debug, Copy)]
pub struct JsonCodec;

impl MessageCodec for JsonCodec {
    fn encode<T: Serialize>(&self, msg: &T) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(msg).map_err(|e| CodecError::Encode(Box::new(e)))
    }

    fn decode<T: DeserializeOwned>(&self, buf: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(buf).map_err(|e| CodecError::Decode(Box::new(e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct TestMessage {
        id: u32,
        content: String,
    }

    #[test]
    fn test_json_codec_roundtrip() {
        let codec = JsonCodec;
        let msg = TestMessage {
            id: 42,
            content: "hello world".to_string(),
        };

        let bytes = codec.encode(&msg).expect("encode should succeed");
        let decoded: TestMessage = codec.decode(&bytes).expect("decode should succeed");
        assert_eq!(msg, decoded);
    }

    #[test]
    fn test_json_codec_decode_error() {
        let codec = JsonCodec;
        let result: Result<TestMessage, CodecError> = codec.decode(b"not valid json {");
        assert!(matches!(result, Err(CodecError::Decode(_))));
    }

    #[test]
    fn test_codec_error_converts_to_channel_error() {
        let codec = JsonCodec;
        let error = codec
            .decode::<TestMessage>(b"{")
            .expect_err("decode should fail");
        match ChannelError::from(error) {
            ChannelError::Codec { message } => assert!(message.starts_with("decode failed")),
            other => panic!("expected codec error, got {:?}", other),
        }
    }
}
