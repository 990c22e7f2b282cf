use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

use crate::types::{Channel, ExtractedMessage};

/// Per-channel payload-shape extractors producing canonical message fields.
///
/// Unlike the verifier, normalization never fails: every missing field is
/// substituted with an empty string or left for
/// [`NormalizedWebhookPayload::assemble`](crate::types::NormalizedWebhookPayload::assemble)
/// to default. A verified request is never rejected because its body has an
/// unexpected shape.
pub struct Normalizer;

impl Normalizer {
    pub fn normalize(channel: Channel, payload: &Value) -> ExtractedMessage {
        match channel {
            Channel::Whatsapp => Self::normalize_whatsapp(payload),
            Channel::Telegram => Self::normalize_telegram(payload),
            Channel::Line => Self::normalize_line(payload),
            Channel::Messenger => Self::normalize_messenger(payload),
        }
    }

    /// `entry[0].changes[0].value.messages[0]` carries the message;
    /// `value.metadata.phone_number_id` identifies the receiving number.
    fn normalize_whatsapp(payload: &Value) -> ExtractedMessage {
        let value = payload
            .get("entry")
            .and_then(|entry| entry.get(0))
            .and_then(|entry| entry.get("changes"))
            .and_then(|changes| changes.get(0))
            .and_then(|change| change.get("value"));
        let message = value.and_then(|value| value.get("messages")).and_then(|m| m.get(0));

        let event_type = if message.is_some() {
            "message".to_string()
        } else if value.map(|v| v.get("statuses").is_some()).unwrap_or(false) {
            "status".to_string()
        } else {
            "unknown".to_string()
        };

        ExtractedMessage {
            event_type,
            sender_id: str_field(message, "from"),
            chat_id: value
                .and_then(|v| v.get("metadata"))
                .and_then(|m| m.get("phone_number_id"))
                .map(id_string)
                .unwrap_or_default(),
            text: message
                .and_then(|m| m.get("text"))
                .and_then(|t| t.get("body"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            message_id: opt_str_field(message, "id"),
            timestamp: message
                .and_then(|m| m.get("timestamp"))
                .and_then(unix_seconds),
        }
    }

    /// Telegram updates wrap the message in `message` or `edited_message`.
    fn normalize_telegram(payload: &Value) -> ExtractedMessage {
        let (message, event_type) = if let Some(edited) = payload.get("edited_message") {
            (Some(edited), "message_edit")
        } else if let Some(message) = payload.get("message") {
            (Some(message), "message")
        } else {
            (None, "unknown")
        };

        ExtractedMessage {
            event_type: event_type.to_string(),
            sender_id: message
                .and_then(|m| m.get("from"))
                .and_then(|f| f.get("id"))
                .map(id_string)
                .unwrap_or_default(),
            chat_id: message
                .and_then(|m| m.get("chat"))
                .and_then(|c| c.get("id"))
                .map(id_string)
                .unwrap_or_default(),
            text: str_field(message, "text"),
            message_id: message
                .and_then(|m| m.get("message_id"))
                .map(id_string)
                .filter(|id| !id.is_empty()),
            timestamp: message.and_then(|m| m.get("date")).and_then(unix_seconds),
        }
    }

    /// LINE batches deliveries under `events[]`; the gateway takes the first.
    /// Chat resolution prefers group over room over the 1:1 user id.
    fn normalize_line(payload: &Value) -> ExtractedMessage {
        let event = payload.get("events").and_then(|events| events.get(0));
        let source = event.and_then(|e| e.get("source"));
        let message = event.and_then(|e| e.get("message"));

        let chat_id = source
            .and_then(|s| {
                s.get("groupId")
                    .or_else(|| s.get("roomId"))
                    .or_else(|| s.get("userId"))
            })
            .map(id_string)
            .unwrap_or_default();

        ExtractedMessage {
            event_type: event
                .and_then(|e| e.get("type"))
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
            sender_id: str_field(source, "userId"),
            chat_id,
            text: str_field(message, "text"),
            message_id: opt_str_field(message, "id"),
            timestamp: event
                .and_then(|e| e.get("timestamp"))
                .and_then(unix_millis),
        }
    }

    /// `entry[0].messaging[0]` carries the event; `message.is_echo` marks
    /// messages the page sent itself.
    fn normalize_messenger(payload: &Value) -> ExtractedMessage {
        let messaging = payload
            .get("entry")
            .and_then(|entry| entry.get(0))
            .and_then(|entry| entry.get("messaging"))
            .and_then(|m| m.get(0));
        let message = messaging.and_then(|m| m.get("message"));

        let is_echo = message
            .and_then(|m| m.get("is_echo"))
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let event_type = if message.is_none() {
            "unknown"
        } else if is_echo {
            "echo"
        } else {
            "message"
        };

        ExtractedMessage {
            event_type: event_type.to_string(),
            sender_id: messaging
                .and_then(|m| m.get("sender"))
                .and_then(|s| s.get("id"))
                .map(id_string)
                .unwrap_or_default(),
            chat_id: messaging
                .and_then(|m| m.get("recipient"))
                .and_then(|r| r.get("id"))
                .map(id_string)
                .unwrap_or_default(),
            text: str_field(message, "text"),
            message_id: opt_str_field(message, "mid"),
            timestamp: messaging
                .and_then(|m| m.get("timestamp"))
                .and_then(unix_millis),
        }
    }
}

/// Renders an id that may arrive as a JSON string or number.
fn id_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => String::new(),
    }
}

fn str_field(container: Option<&Value>, field: &str) -> String {
    container
        .and_then(|c| c.get(field))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn opt_str_field(container: Option<&Value>, field: &str) -> Option<String> {
    container
        .and_then(|c| c.get(field))
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Unix seconds arriving as a number or a decimal string (WhatsApp sends
/// strings, Telegram numbers).
fn unix_seconds(value: &Value) -> Option<DateTime<Utc>> {
    let secs = match value {
        Value::Number(n) => n.as_i64()?,
        Value::String(s) => s.parse::<i64>().ok()?,
        _ => return None,
    };
    Utc.timestamp_opt(secs, 0).single()
}

fn unix_millis(value: &Value) -> Option<DateTime<Utc>> {
    let millis = match value {
        Value::Number(n) => n.as_i64()?,
        Value::String(s) => s.parse::<i64>().ok()?,
        _ => return None,
    };
    Utc.timestamp_millis_opt(millis).single()
}
