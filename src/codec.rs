use serde_json::Value;

use crate::error::BoxError;

/// Encoder/decoder for `Body::Structured` payloads and `Response::value`.
pub trait StructuredCodec: Send + Sync + 'static {
    fn content_type(&self) -> &'static str;

    fn encode(&self, value: &Value) -> Result<Vec<u8>, BoxError>;

    fn decode(&self, body: &[u8]) -> Result<Value, BoxError>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct JsonCodec;

impl StructuredCodec for JsonCodec {
    fn content_type(&self) -> &'static str {
        "application/json"
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>, BoxError> {
        Ok(serde_json::to_vec(value)?)
    }

    fn decode(&self, body: &[u8]) -> Result<Value, BoxError> {
        Ok(serde_json::from_slice(body)?)
    }
}
