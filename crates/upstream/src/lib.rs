//! Client for the downstream processing API.
//!
//! The forwarder owns the gateway's delivery guarantee: a verified,
//! deduplicated payload either gets a synchronous upstream result or is
//! reported as exhausted so the caller can dead-letter it. Nothing is
//! silently dropped.

use std::time::Duration;

use reqwest::Client;
use thiserror::Error;
use tracing::warn;
use url::Url;

use im_gateway_core::types::NormalizedWebhookPayload;

/// Retry/backoff knobs for the forward loop.
#[derive(Debug, Clone)]
pub struct ForwardPolicy {
    /// Retries after the first attempt; total attempts = `max_retries + 1`.
    pub max_retries: u32,
    pub retry_base: Duration,
    pub attempt_timeout: Duration,
}

/// Terminal result of a forward loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardOutcome {
    /// Upstream answered 2xx; status and body pass through to the sender.
    Delivered { status: u16, body: String },
    /// Upstream answered 4xx. Client errors are not retried; the response
    /// passes through verbatim.
    Rejected { status: u16, body: String },
    /// Every attempt failed with a 5xx or a network/timeout error.
    Exhausted { attempts: u32, last_error: String },
}

/// Errors constructing the client. Runtime delivery failures are data
/// ([`ForwardOutcome`]), not errors.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("failed to build upstream url: {0}")]
    Url(#[from] url::ParseError),
}

/// Client for the downstream webhook intake endpoint.
#[derive(Clone)]
pub struct UpstreamClient {
    http: Client,
    endpoint: Url,
}

impl UpstreamClient {
    /// Creates a client for `{base_url}/api/v1/im/webhook`. `base_url` must
    /// end with a trailing slash for the join to keep its path.
    pub fn new(base_url: Url, http: Client) -> Result<Self, UpstreamError> {
        let endpoint = base_url.join("api/v1/im/webhook")?;
        Ok(Self { http, endpoint })
    }

    /// Runs the bounded retry loop for one payload.
    ///
    /// Attempts are strictly sequential; the delay after a failed attempt
    /// `n` (zero-based) is `retry_base * 2^n`. The per-attempt timeout is
    /// the only cancellation mechanism.
    pub async fn forward(
        &self,
        payload: &NormalizedWebhookPayload,
        policy: &ForwardPolicy,
    ) -> ForwardOutcome {
        let attempts = policy.max_retries + 1;
        let mut last_error = String::new();

        for attempt in 0..attempts {
            match self.attempt(payload, policy.attempt_timeout).await {
                AttemptResult::Done(outcome) => return outcome,
                AttemptResult::Retriable(error) => {
                    warn!(
                        stage = "forward",
                        channel = payload.channel.as_str(),
                        idempotency_key = %payload.idempotency_key,
                        attempt,
                        error = %error,
                        "forward attempt failed"
                    );
                    last_error = error;
                }
            }

            if attempt + 1 < attempts {
                tokio::time::sleep(backoff_delay(policy.retry_base, attempt)).await;
            }
        }

        ForwardOutcome::Exhausted {
            attempts,
            last_error,
        }
    }

    async fn attempt(
        &self,
        payload: &NormalizedWebhookPayload,
        timeout: Duration,
    ) -> AttemptResult {
        let send = self
            .http
            .post(self.endpoint.clone())
            .timeout(timeout)
            .header("X-Webhook-Channel", payload.channel.as_str())
            .header("X-Webhook-Signature-Valid", "true")
            .header("X-Webhook-Idempotency-Key", &payload.idempotency_key)
            .header("X-Webhook-Message-Id", &payload.message_id)
            .header("X-Webhook-Sender-Id", &payload.sender_id)
            .json(payload)
            .send()
            .await;

        match send {
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                if status.is_success() {
                    AttemptResult::Done(ForwardOutcome::Delivered {
                        status: status.as_u16(),
                        body,
                    })
                } else if status.is_client_error() {
                    AttemptResult::Done(ForwardOutcome::Rejected {
                        status: status.as_u16(),
                        body,
                    })
                } else {
                    AttemptResult::Retriable(format!("upstream returned {status}"))
                }
            }
            Err(err) => AttemptResult::Retriable(format!("request failed: {err}")),
        }
    }
}

enum AttemptResult {
    Done(ForwardOutcome),
    Retriable(String),
}

/// `retry_base * 2^attempt`, saturating so an extreme retry configuration
/// caps the delay instead of panicking on overflow.
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt))
}
