use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Closed set of messaging platforms the gateway accepts callbacks from.
///
/// Each variant carries its own verification and normalization strategy;
/// adding a platform means adding a variant and filling in the match arms,
/// never touching the pipeline itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Whatsapp,
    Telegram,
    Line,
    Messenger,
}

impl Channel {
    pub const ALL: [Channel; 4] = [
        Channel::Whatsapp,
        Channel::Telegram,
        Channel::Line,
        Channel::Messenger,
    ];

    /// Resolves the trailing segment of `/webhook/{channel}` to a variant.
    pub fn from_path(segment: &str) -> Option<Self> {
        match segment {
            "whatsapp" => Some(Self::Whatsapp),
            "telegram" => Some(Self::Telegram),
            "line" => Some(Self::Line),
            "messenger" => Some(Self::Messenger),
            _ => None,
        }
    }

    /// Canonical lowercase name used in KV keys, URNs, and metric labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Whatsapp => "whatsapp",
            Self::Telegram => "telegram",
            Self::Line => "line",
            Self::Messenger => "messenger",
        }
    }

    pub fn metric_label(self) -> &'static str {
        self.as_str()
    }

    /// Request header carrying the signature (or shared secret) to verify.
    pub fn signature_header(self) -> &'static str {
        match self {
            Self::Whatsapp | Self::Messenger => "X-Hub-Signature-256",
            Self::Telegram => "X-Telegram-Bot-Api-Secret-Token",
            Self::Line => "X-Line-Signature",
        }
    }

    /// Whether the platform performs the GET hub-challenge handshake.
    pub fn supports_challenge(self) -> bool {
        matches!(self, Self::Whatsapp | Self::Messenger)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fields a normalizer strategy managed to extract from a platform payload.
///
/// Everything is optional or defaultable; assembly into a
/// [`NormalizedWebhookPayload`] fills the gaps.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractedMessage {
    pub event_type: String,
    pub sender_id: String,
    pub chat_id: String,
    pub text: String,
    pub message_id: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

/// Canonical record handed to the downstream API, one per inbound message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedWebhookPayload {
    pub channel: Channel,
    pub event_type: String,
    pub sender_id: String,
    pub chat_id: String,
    pub text: String,
    pub message_id: String,
    pub timestamp: DateTime<Utc>,
    /// Original decoded body, passed through opaquely.
    pub raw: Value,
    pub signature_valid: bool,
    pub idempotency_key: String,
    pub uri: String,
    pub urn: String,
}

impl NormalizedWebhookPayload {
    /// Builds the canonical record from whatever the normalizer extracted.
    ///
    /// A missing platform message id gets a fresh UUID, and in that case the
    /// idempotency key falls back to hashing the raw body so re-deliveries
    /// of the same bytes still collapse onto one key.
    pub fn assemble(
        channel: Channel,
        extracted: ExtractedMessage,
        raw: Value,
        raw_body: &[u8],
        received_at: DateTime<Utc>,
    ) -> Self {
        let idempotency_key =
            idempotency_key(channel, extracted.message_id.as_deref(), raw_body);
        let message_id = extracted
            .message_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let sender_id = extracted.sender_id;
        let uri = format!("im://{channel}/{sender_id}/{message_id}");
        let urn = format!("urn:im:{channel}:{sender_id}:{message_id}");

        Self {
            channel,
            event_type: extracted.event_type,
            sender_id,
            chat_id: extracted.chat_id,
            text: extracted.text,
            message_id,
            timestamp: extracted.timestamp.unwrap_or(received_at),
            raw,
            signature_valid: true,
            idempotency_key,
            uri,
            urn,
        }
    }
}

/// Deterministic duplicate-detection key.
///
/// Hashes `{channel}:{message_id}` when the platform assigned an id, and
/// `{channel}:` + raw body bytes otherwise. Same logical message, same key.
pub fn idempotency_key(channel: Channel, message_id: Option<&str>, raw_body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(channel.as_str().as_bytes());
    hasher.update(b":");
    match message_id {
        Some(id) => hasher.update(id.as_bytes()),
        None => hasher.update(raw_body),
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn resolves_known_channels() {
        assert_eq!(Channel::from_path("whatsapp"), Some(Channel::Whatsapp));
        assert_eq!(Channel::from_path("telegram"), Some(Channel::Telegram));
        assert_eq!(Channel::from_path("line"), Some(Channel::Line));
        assert_eq!(Channel::from_path("messenger"), Some(Channel::Messenger));
        assert_eq!(Channel::from_path("signal"), None);
        assert_eq!(Channel::from_path(""), None);
    }

    #[test]
    fn idempotency_key_is_stable() {
        let first = idempotency_key(Channel::Whatsapp, Some("wamid.123"), b"ignored");
        let second = idempotency_key(Channel::Whatsapp, Some("wamid.123"), b"different");
        assert_eq!(first, second);
        assert_eq!(first.len(), 64);
    }

    #[test]
    fn idempotency_key_separates_channels() {
        let whatsapp = idempotency_key(Channel::Whatsapp, Some("42"), b"");
        let telegram = idempotency_key(Channel::Telegram, Some("42"), b"");
        assert_ne!(whatsapp, telegram);
    }

    #[test]
    fn idempotency_key_falls_back_to_body() {
        let body = br#"{"not":"parseable as a message"}"#;
        let first = idempotency_key(Channel::Line, None, body);
        let second = idempotency_key(Channel::Line, None, body);
        assert_eq!(first, second);
        assert_ne!(first, idempotency_key(Channel::Line, None, b"other bytes"));
    }

    #[test]
    fn assemble_fills_defaults() {
        let received = "2024-05-01T12:00:00Z".parse::<DateTime<Utc>>().expect("ts");
        let payload = NormalizedWebhookPayload::assemble(
            Channel::Telegram,
            ExtractedMessage::default(),
            Value::Null,
            b"not json",
            received,
        );

        assert!(!payload.message_id.is_empty());
        assert_eq!(payload.timestamp, received);
        assert!(payload.signature_valid);
        assert_eq!(
            payload.idempotency_key,
            idempotency_key(Channel::Telegram, None, b"not json")
        );
    }

    #[test]
    fn assemble_builds_stable_identifiers() {
        let received = Utc::now();
        let extracted = ExtractedMessage {
            event_type: "message".to_string(),
            sender_id: "u-1".to_string(),
            chat_id: "c-1".to_string(),
            text: "hi".to_string(),
            message_id: Some("m-1".to_string()),
            timestamp: None,
        };
        let payload = NormalizedWebhookPayload::assemble(
            Channel::Line,
            extracted,
            json!({"events": []}),
            b"{}",
            received,
        );

        assert_eq!(payload.uri, "im://line/u-1/m-1");
        assert_eq!(payload.urn, "urn:im:line:u-1:m-1");
    }
}
