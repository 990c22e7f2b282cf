use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::types::Channel;

/// Per-channel secret material resolved from configuration.
///
/// Every field is optional; a channel whose secret is absent simply fails
/// verification instead of erroring out.
#[derive(Debug, Clone, Default)]
pub struct ChannelSecrets {
    pub whatsapp_app_secret: Option<String>,
    pub whatsapp_verify_token: Option<String>,
    pub telegram_secret_token: Option<String>,
    pub line_channel_secret: Option<String>,
    pub messenger_app_secret: Option<String>,
    pub messenger_verify_token: Option<String>,
}

impl Channel {
    /// Verifies the raw request body against the channel's signature header.
    ///
    /// Missing header, missing secret, undecodable digest, and mismatch all
    /// resolve to `false`; the caller maps `false` to a 401.
    pub fn verify(
        self,
        secrets: &ChannelSecrets,
        signature: Option<&str>,
        body: &[u8],
    ) -> bool {
        let Some(signature) = signature else {
            return false;
        };
        match self {
            Self::Whatsapp => verify_hub_signature(
                secrets.whatsapp_app_secret.as_deref(),
                body,
                signature,
            ),
            Self::Messenger => verify_hub_signature(
                secrets.messenger_app_secret.as_deref(),
                body,
                signature,
            ),
            Self::Line => verify_line_signature(
                secrets.line_channel_secret.as_deref(),
                body,
                signature,
            ),
            Self::Telegram => {
                verify_shared_token(secrets.telegram_secret_token.as_deref(), signature)
            }
        }
    }

    /// Token the GET handshake must match, for channels that have one.
    pub fn verify_token(self, secrets: &ChannelSecrets) -> Option<&str> {
        match self {
            Self::Whatsapp => secrets.whatsapp_verify_token.as_deref(),
            Self::Messenger => secrets.messenger_verify_token.as_deref(),
            Self::Telegram | Self::Line => None,
        }
    }
}

/// Constant-time byte comparison; the execution time does not depend on
/// where the first mismatching byte occurs.
pub fn timing_safe_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

fn hmac_sha256(secret: &str, body: &[u8]) -> Option<Vec<u8>> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(body);
    Some(mac.finalize().into_bytes().to_vec())
}

/// `X-Hub-Signature-256: sha256={hex}` over the raw body (WhatsApp, Messenger).
fn verify_hub_signature(secret: Option<&str>, body: &[u8], signature: &str) -> bool {
    let Some(secret) = secret else {
        return false;
    };
    let Some(hex_part) = signature.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(provided) = hex::decode(hex_part) else {
        return false;
    };
    match hmac_sha256(secret, body) {
        Some(expected) => timing_safe_eq(&expected, &provided),
        None => false,
    }
}

/// `X-Line-Signature: {base64}` over the raw body.
fn verify_line_signature(secret: Option<&str>, body: &[u8], signature: &str) -> bool {
    let Some(secret) = secret else {
        return false;
    };
    let Ok(provided) = BASE64.decode(signature) else {
        return false;
    };
    match hmac_sha256(secret, body) {
        Some(expected) => timing_safe_eq(&expected, &provided),
        None => false,
    }
}

/// Plain shared-secret header (Telegram's `X-Telegram-Bot-Api-Secret-Token`).
fn verify_shared_token(secret: Option<&str>, provided: &str) -> bool {
    match secret {
        Some(secret) => timing_safe_eq(secret.as_bytes(), provided.as_bytes()),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secrets() -> ChannelSecrets {
        ChannelSecrets {
            whatsapp_app_secret: Some("wa-secret".to_string()),
            whatsapp_verify_token: Some("wa-token".to_string()),
            telegram_secret_token: Some("tg-token".to_string()),
            line_channel_secret: Some("line-secret".to_string()),
            messenger_app_secret: Some("fb-secret".to_string()),
            messenger_verify_token: Some("fb-token".to_string()),
        }
    }

    fn hub_signature(secret: &str, body: &[u8]) -> String {
        format!("sha256={}", hex::encode(hmac_sha256(secret, body).expect("mac")))
    }

    fn line_signature(secret: &str, body: &[u8]) -> String {
        BASE64.encode(hmac_sha256(secret, body).expect("mac"))
    }

    #[test]
    fn whatsapp_accepts_valid_hub_signature() {
        let body = br#"{"entry":[]}"#;
        let signature = hub_signature("wa-secret", body);
        assert!(Channel::Whatsapp.verify(&secrets(), Some(&signature), body));
    }

    #[test]
    fn whatsapp_rejects_tampered_body() {
        let signature = hub_signature("wa-secret", b"original");
        assert!(!Channel::Whatsapp.verify(&secrets(), Some(&signature), b"tampered"));
    }

    #[test]
    fn hub_signature_requires_prefix_and_hex() {
        let body = b"body";
        let digest = hex::encode(hmac_sha256("wa-secret", body).expect("mac"));
        assert!(!Channel::Whatsapp.verify(&secrets(), Some(&digest), body));
        assert!(!Channel::Whatsapp.verify(&secrets(), Some("sha256=zzzz"), body));
    }

    #[test]
    fn line_accepts_valid_base64_signature() {
        let body = br#"{"events":[]}"#;
        let signature = line_signature("line-secret", body);
        assert!(Channel::Line.verify(&secrets(), Some(&signature), body));
    }

    #[test]
    fn line_rejects_wrong_secret() {
        let body = b"body";
        let signature = line_signature("other-secret", body);
        assert!(!Channel::Line.verify(&secrets(), Some(&signature), body));
    }

    #[test]
    fn telegram_matches_shared_token() {
        assert!(Channel::Telegram.verify(&secrets(), Some("tg-token"), b""));
        assert!(!Channel::Telegram.verify(&secrets(), Some("wrong"), b""));
    }

    #[test]
    fn missing_header_or_secret_fails_closed() {
        for channel in Channel::ALL {
            assert!(!channel.verify(&secrets(), None, b"body"));
            assert!(!channel.verify(&ChannelSecrets::default(), Some("anything"), b"body"));
        }
    }

    #[test]
    fn empty_body_does_not_panic() {
        let signature = hub_signature("fb-secret", b"");
        assert!(Channel::Messenger.verify(&secrets(), Some(&signature), b""));
    }

    #[test]
    fn verify_token_only_for_handshake_channels() {
        let secrets = secrets();
        assert_eq!(Channel::Whatsapp.verify_token(&secrets), Some("wa-token"));
        assert_eq!(Channel::Messenger.verify_token(&secrets), Some("fb-token"));
        assert_eq!(Channel::Telegram.verify_token(&secrets), None);
        assert_eq!(Channel::Line.verify_token(&secrets), None);
    }
}
