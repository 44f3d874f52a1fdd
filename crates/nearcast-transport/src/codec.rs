//! Payload codecs
//!
//! The tracked payload is encoded once per fan-out pass and the same bytes go
//! to every target, so a codec failure is a whole-pass failure.

use bytes::Bytes;

use nearcast_core::{NearcastError, NearcastResult, TrackedPayload};

/// Default upper bound on an encoded payload
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 64 * 1024;

/// Converts tracked payloads to and from wire bytes
pub trait PayloadCodec: Send + Sync {
    fn encode(&self, payload: &TrackedPayload) -> NearcastResult<Bytes>;

    fn decode(&self, bytes: &[u8]) -> NearcastResult<TrackedPayload>;
}

/// JSON object encoding with a size limit
#[derive(Clone, Debug)]
pub struct JsonCodec {
    max_bytes: usize,
}

impl JsonCodec {
    pub fn new(max_bytes: usize) -> Self {
        JsonCodec { max_bytes }
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }
}

impl Default for JsonCodec {
    fn default() -> Self {
        JsonCodec::new(DEFAULT_MAX_PAYLOAD_BYTES)
    }
}

impl PayloadCodec for JsonCodec {
    fn encode(&self, payload: &TrackedPayload) -> NearcastResult<Bytes> {
        let encoded =
            serde_json::to_vec(payload).map_err(|e| NearcastError::EncodingError(e.to_string()))?;

        if encoded.len() > self.max_bytes {
            return Err(NearcastError::EncodingError(format!(
                "encoded payload is {} bytes, limit is {}",
                encoded.len(),
                self.max_bytes
            )));
        }
        Ok(Bytes::from(encoded))
    }

    fn decode(&self, bytes: &[u8]) -> NearcastResult<TrackedPayload> {
        if bytes.len() > self.max_bytes {
            return Err(NearcastError::DecodingError(format!(
                "received {} bytes, limit is {}",
                bytes.len(),
                self.max_bytes
            )));
        }
        serde_json::from_slice(bytes).map_err(|e| NearcastError::DecodingError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_codec_encodes_object() {
        let codec = JsonCodec::default();
        let payload = TrackedPayload::new().with("x", 1);

        let bytes = codec.encode(&payload).unwrap();
        assert_eq!(&bytes[..], br#"{"x":1}"#);
        assert_eq!(codec.decode(&bytes).unwrap(), payload);
    }

    #[test]
    fn test_json_codec_enforces_limit() {
        let codec = JsonCodec::new(8);
        let payload = TrackedPayload::new().with("long", "0123456789");

        let err = codec.encode(&payload).unwrap_err();
        assert!(matches!(err, NearcastError::EncodingError(_)));
    }

    #[test]
    fn test_json_codec_rejects_non_object() {
        let codec = JsonCodec::default();
        assert!(matches!(
            codec.decode(b"[1,2,3]"),
            Err(NearcastError::DecodingError(_))
        ));
        assert!(matches!(
            codec.decode(b"not json"),
            Err(NearcastError::DecodingError(_))
        ));
        assert_eq!(
            codec.decode(br#"{"nested":{"a":[1]}}"#).unwrap().get("nested"),
            Some(&json!({"a": [1]}))
        );
    }
}
