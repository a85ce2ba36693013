use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::transport::Delivery;

/// Timestamp layout of `receivedAt`: local time, milliseconds, numeric offset.
pub const RECEIVED_AT_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f%z";

/// Current local time rendered with [`RECEIVED_AT_FORMAT`].
pub fn received_at_now() -> String {
    chrono::Local::now().format(RECEIVED_AT_FORMAT).to_string()
}

// ════════════════════════════════════════════════════════════════
//  Raw payload
// ════════════════════════════════════════════════════════════════

/// The payload exactly as it arrived on the transport.
///
/// UTF-8 payloads are stored inline for readability, anything else as
/// base64. On disk: `{"encoding":"utf8","data":"..."}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "encoding", content = "data", rename_all = "snake_case")]
pub enum RawPayload {
    Utf8(String),
    Base64(String),
}

impl RawPayload {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        match std::str::from_utf8(bytes) {
            Ok(text) => RawPayload::Utf8(text.to_string()),
            Err(_) => RawPayload::Base64(base64::engine::general_purpose::STANDARD.encode(bytes)),
        }
    }

    /// Recover the original bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ApiError> {
        match self {
            RawPayload::Utf8(text) => Ok(text.as_bytes().to_vec()),
            RawPayload::Base64(b64) => base64::engine::general_purpose::STANDARD
                .decode(b64)
                .map_err(|e| ApiError::format_err(format!("base64 payload: {e}"))),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            RawPayload::Utf8(s) | RawPayload::Base64(s) => s.is_empty(),
        }
    }
}

// ════════════════════════════════════════════════════════════════
//  LogRecord
// ════════════════════════════════════════════════════════════════

/// One recorded message. Built once per delivery, serialized once.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    pub received_at: String,
    #[serde(rename = "entityID")]
    pub entity_id: String,
    pub message_type: String,
    pub sender: String,
    /// Parsed JSON payload; absent when the payload is not valid JSON.
    /// A JSON `null` payload is `Some(Value::Null)`.
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "present_value")]
    pub payload: Option<serde_json::Value>,
    /// Authoritative copy of the payload bytes.
    pub raw: RawPayload,
}

/// A present field is always `Some`, even when it holds `null`.
fn present_value<'de, D>(deserializer: D) -> Result<Option<serde_json::Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    serde_json::Value::deserialize(deserializer).map(Some)
}

impl LogRecord {
    /// Build a record stamped with the given receive time.
    ///
    /// JSON parsing is best effort: on failure `payload` stays `None`
    /// and only `raw` carries the message.
    pub fn new(
        received_at: String,
        entity_id: &str,
        message_type: &str,
        sender: &str,
        payload: &[u8],
    ) -> Self {
        Self {
            received_at,
            entity_id: entity_id.to_string(),
            message_type: message_type.to_string(),
            sender: sender.to_string(),
            payload: serde_json::from_slice(payload).ok(),
            raw: RawPayload::from_bytes(payload),
        }
    }

    /// Build a record for a delivery, stamped now.
    pub fn from_delivery(delivery: &Delivery) -> Self {
        Self::new(
            received_at_now(),
            &delivery.entity_id,
            &delivery.message_type,
            &delivery.sender,
            &delivery.payload,
        )
    }

    /// Whether structured parsing failed on a non-empty payload.
    pub fn is_unparsed(&self) -> bool {
        self.payload.is_none() && !self.raw.is_empty()
    }

    /// Serialize as a single JSON line, newline included.
    pub fn to_line(&self) -> Result<Vec<u8>, ApiError> {
        let mut line = serde_json::to_vec(self)?;
        line.push(b'\n');
        Ok(line)
    }
}
