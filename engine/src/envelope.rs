//! Message envelope carried over the pub/sub broker.
//!
//! All messages are JSON-encoded with camelCase field names. The envelope is
//! opaque to the sync core; request/reply calls use `reply_to` to name the
//! topic the answer should be published on.

use serde::{Deserialize, Serialize};

/// Ask the backend for the device's remote settings.
pub const ACTION_FETCH_CONFIG: i32 = 1;
/// Reply carrying the device's remote settings.
pub const ACTION_CONFIG: i32 = 2;
/// The backend could not serve a request.
pub const ACTION_ERROR: i32 = 99;

/// A typed message exchanged with the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Action code, interpreted by the receiver
    pub action: i32,
    /// Action-specific payload, usually JSON text
    #[serde(default)]
    pub payload: String,
    /// Topic to publish the reply on; empty for one-way messages
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reply_to: String,
}

impl Envelope {
    /// Create a one-way message.
    pub fn new(action: i32, payload: impl Into<String>) -> Self {
        Self {
            action,
            payload: payload.into(),
            reply_to: String::new(),
        }
    }

    /// Create a request expecting an answer on `reply_to`.
    pub fn request(action: i32, payload: impl Into<String>, reply_to: impl Into<String>) -> Self {
        Self {
            action,
            payload: payload.into(),
            reply_to: reply_to.into(),
        }
    }

    /// Whether the sender expects a reply.
    pub fn expects_reply(&self) -> bool {
        !self.reply_to.is_empty()
    }

    /// Encode to wire bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        // Serializing a struct of an integer and two strings cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Decode from wire bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_serialization() {
        let msg = Envelope::request(ACTION_FETCH_CONFIG, "{}", "devices/d1/inbox/abc");
        let json = String::from_utf8(msg.to_bytes()).unwrap();
        assert!(json.contains(r#""action":1"#));
        assert!(json.contains(r#""replyTo":"devices/d1/inbox/abc""#));
        assert!(msg.expects_reply());
    }

    #[test]
    fn one_way_omits_reply_to() {
        let msg = Envelope::new(ACTION_CONFIG, "x");
        let json = String::from_utf8(msg.to_bytes()).unwrap();
        assert_eq!(json, r#"{"action":2,"payload":"x"}"#);
        assert!(!msg.expects_reply());
    }

    #[test]
    fn decode_with_defaults() {
        let msg = Envelope::from_bytes(br#"{"action": 99}"#).unwrap();
        assert_eq!(msg.action, ACTION_ERROR);
        assert!(msg.payload.is_empty());
        assert!(msg.reply_to.is_empty());

        assert!(Envelope::from_bytes(b"not json").is_err());
    }
}
