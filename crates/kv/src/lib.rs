//! Client for the external key-value store, the gateway's only durable
//! shared state.
//!
//! The store speaks a Redis-REST-style HTTP protocol: `GET {base}/get/{key}`
//! returns `{"result": <string|null>}`, `POST {base}/set/{key}?ex={ttl}`
//! stores the request body under the key, and `GET {base}/ping` answers
//! `{"result":"PONG"}`. Requests carry a bearer token when one is
//! configured.
//!
//! The store is eventually consistent and offers no compare-and-swap, so
//! every repository here is read-then-write and approximate by design.

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use url::Url;

/// TTL for rate-limit window counters. Slightly larger than the one-minute
/// bucket width to tolerate clock skew between gateway instances.
const RATE_WINDOW_TTL_SECS: u64 = 120;

/// Errors produced by KV operations.
#[derive(Debug, Error)]
pub enum KvError {
    #[error("failed to build kv url: {0}")]
    Url(#[from] url::ParseError),
    #[error("kv request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("kv returned status {status}: {body}")]
    Status { status: u16, body: String },
}

/// Top-level handle owning the HTTP connection to the KV store.
#[derive(Clone)]
pub struct KvStore {
    http: Client,
    base_url: Url,
    token: Option<String>,
}

impl KvStore {
    /// Creates a store handle. `base_url` must end with a trailing slash for
    /// key paths to join correctly.
    pub fn new(base_url: Url, token: Option<String>, http: Client) -> Self {
        Self {
            http,
            base_url,
            token,
        }
    }

    /// Returns a handle for rate-limit window counters.
    pub fn rate_limits(&self) -> RateLimitRepository {
        RateLimitRepository { kv: self.clone() }
    }

    /// Returns a handle for dedup sentinels.
    pub fn dedup(&self) -> DedupRepository {
        DedupRepository { kv: self.clone() }
    }

    /// Returns a handle for dead-letter records.
    pub fn dead_letters(&self) -> DeadLetterRepository {
        DeadLetterRepository { kv: self.clone() }
    }

    /// Liveness probe used by the health endpoint.
    pub async fn ping(&self) -> Result<(), KvError> {
        let url = self.base_url.join("ping")?;
        let response = self.authorized(self.http.get(url)).send().await?;
        ensure_success(response).await?;
        Ok(())
    }

    /// Reads the value stored under `key`, if any.
    pub async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let url = self.base_url.join(&format!("get/{key}"))?;
        let response = self.authorized(self.http.get(url)).send().await?;
        let response = ensure_success(response).await?;
        let envelope: KvResult = response.json().await?;
        Ok(match envelope.result {
            Value::String(s) => Some(s),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
    }

    /// Stores `value` under `key` with an expiry of `ttl_secs`.
    pub async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), KvError> {
        let mut url = self.base_url.join(&format!("set/{key}"))?;
        url.query_pairs_mut().append_pair("ex", &ttl_secs.to_string());
        let response = self
            .authorized(self.http.post(url))
            .body(value.to_string())
            .send()
            .await?;
        ensure_success(response).await?;
        Ok(())
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => builder.header("Authorization", format!("Bearer {token}")),
            None => builder,
        }
    }
}

#[derive(Debug, Deserialize)]
struct KvResult {
    #[serde(default)]
    result: Value,
}

async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, KvError> {
    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<unavailable>"));
        return Err(KvError::Status {
            status: status.as_u16(),
            body,
        });
    }
    Ok(response)
}

/// Outcome of a rate-limit admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u32,
}

/// Sliding-window-by-minute-bucket counters under `rl:{ip}:{bucket}`.
#[derive(Clone)]
pub struct RateLimitRepository {
    kv: KvStore,
}

impl RateLimitRepository {
    /// Reads the counter for the caller's current minute bucket and, when
    /// under the limit, stores the incremented count. The read and the write
    /// are separate KV calls, so concurrent requests can slip slightly over
    /// the limit; admission is approximate, not exact.
    pub async fn check_and_increment(
        &self,
        ip: &str,
        minute_bucket: i64,
        limit: u32,
    ) -> Result<RateLimitDecision, KvError> {
        let key = format!("rl:{ip}:{minute_bucket}");
        let count = self
            .kv
            .get(&key)
            .await?
            .and_then(|raw| raw.parse::<u32>().ok())
            .unwrap_or(0);

        if count >= limit {
            return Ok(RateLimitDecision {
                allowed: false,
                remaining: 0,
            });
        }

        self.kv
            .set_ex(&key, &(count + 1).to_string(), RATE_WINDOW_TTL_SECS)
            .await?;
        Ok(RateLimitDecision {
            allowed: true,
            remaining: limit - count - 1,
        })
    }
}

/// Result of a dedup probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupOutcome {
    Fresh,
    Duplicate,
}

/// Presence-only sentinels under `dedup:{idempotency_key}`.
#[derive(Clone)]
pub struct DedupRepository {
    kv: KvStore,
}

impl DedupRepository {
    /// Reports `Duplicate` when a sentinel exists, otherwise writes one with
    /// the configured TTL and reports `Fresh`. Read-then-write: two
    /// concurrent requests with the same key can both observe absence and
    /// both proceed. That race is an accepted cost of the lock-free design.
    pub async fn check_and_mark(&self, key: &str, ttl_secs: u64) -> Result<DedupOutcome, KvError> {
        let kv_key = format!("dedup:{key}");
        if self.kv.get(&kv_key).await?.is_some() {
            return Ok(DedupOutcome::Duplicate);
        }
        self.kv.set_ex(&kv_key, "1", ttl_secs).await?;
        Ok(DedupOutcome::Fresh)
    }
}

/// Payload that exhausted its forward retries, persisted for replay.
#[derive(Debug)]
pub struct DeadLetterRecord<'a> {
    pub channel: &'a str,
    pub idempotency_key: &'a str,
    pub payload: &'a Value,
    pub error: &'a str,
    pub failed_at: DateTime<Utc>,
}

/// Durable failure records under `dlq:{channel}:{idempotency_key}`.
#[derive(Clone)]
pub struct DeadLetterRepository {
    kv: KvStore,
}

impl DeadLetterRepository {
    pub async fn record(
        &self,
        record: &DeadLetterRecord<'_>,
        ttl_secs: u64,
    ) -> Result<(), KvError> {
        let key = format!("dlq:{}:{}", record.channel, record.idempotency_key);
        let body = json!({
            "payload": record.payload,
            "error": record.error,
            "failed_at": record.failed_at.to_rfc3339(),
        });
        self.kv.set_ex(&key, &body.to_string(), ttl_secs).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    fn store(server: &MockServer) -> KvStore {
        let base = Url::parse(&server.url("/")).expect("base url");
        KvStore::new(
            base,
            Some("kv-token".to_string()),
            Client::builder().build().expect("client"),
        )
    }

    #[tokio::test]
    async fn get_decodes_null_and_string_results() {
        let server = MockServer::start_async().await;
        let kv = store(&server);

        server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/get/missing")
                    .header("Authorization", "Bearer kv-token");
                then.status(200).json_body(serde_json::json!({"result": null}));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/get/present");
                then.status(200).json_body(serde_json::json!({"result": "7"}));
            })
            .await;

        assert_eq!(kv.get("missing").await.expect("get"), None);
        assert_eq!(kv.get("present").await.expect("get"), Some("7".to_string()));
    }

    #[tokio::test]
    async fn set_ex_sends_ttl_query() {
        let server = MockServer::start_async().await;
        let kv = store(&server);

        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/set/dedup:abc")
                    .query_param("ex", "300")
                    .body("1");
                then.status(200).json_body(serde_json::json!({"result": "OK"}));
            })
            .await;

        kv.set_ex("dedup:abc", "1", 300).await.expect("set");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn error_status_is_surfaced() {
        let server = MockServer::start_async().await;
        let kv = store(&server);

        server
            .mock_async(|when, then| {
                when.method(GET).path("/get/key");
                then.status(503).body("unavailable");
            })
            .await;

        let err = kv.get("key").await.expect_err("should fail");
        match err {
            KvError::Status { status, body } => {
                assert_eq!(status, 503);
                assert_eq!(body, "unavailable");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn rate_limit_allows_under_limit() {
        let server = MockServer::start_async().await;
        let kv = store(&server);

        server
            .mock_async(|when, then| {
                when.method(GET).path("/get/rl:1.2.3.4:100");
                then.status(200).json_body(serde_json::json!({"result": "3"}));
            })
            .await;
        let set = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/set/rl:1.2.3.4:100")
                    .query_param("ex", "120")
                    .body("4");
                then.status(200).json_body(serde_json::json!({"result": "OK"}));
            })
            .await;

        let decision = kv
            .rate_limits()
            .check_and_increment("1.2.3.4", 100, 120)
            .await
            .expect("decision");
        set.assert_async().await;
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 116);
    }

    #[tokio::test]
    async fn rate_limit_denies_at_limit_without_writing() {
        let server = MockServer::start_async().await;
        let kv = store(&server);

        server
            .mock_async(|when, then| {
                when.method(GET).path("/get/rl:1.2.3.4:100");
                then.status(200)
                    .json_body(serde_json::json!({"result": "120"}));
            })
            .await;
        let set = server
            .mock_async(|when, then| {
                when.method(POST).path_contains("/set/rl:");
                then.status(200).json_body(serde_json::json!({"result": "OK"}));
            })
            .await;

        let decision = kv
            .rate_limits()
            .check_and_increment("1.2.3.4", 100, 120)
            .await
            .expect("decision");
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
        assert_eq!(set.hits_async().await, 0);
    }

    #[tokio::test]
    async fn dedup_marks_fresh_keys() {
        let server = MockServer::start_async().await;
        let kv = store(&server);

        server
            .mock_async(|when, then| {
                when.method(GET).path("/get/dedup:k1");
                then.status(200).json_body(serde_json::json!({"result": null}));
            })
            .await;
        let set = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/set/dedup:k1")
                    .query_param("ex", "300")
                    .body("1");
                then.status(200).json_body(serde_json::json!({"result": "OK"}));
            })
            .await;

        let outcome = kv.dedup().check_and_mark("k1", 300).await.expect("outcome");
        set.assert_async().await;
        assert_eq!(outcome, DedupOutcome::Fresh);
    }

    #[tokio::test]
    async fn dedup_reports_duplicates() {
        let server = MockServer::start_async().await;
        let kv = store(&server);

        server
            .mock_async(|when, then| {
                when.method(GET).path("/get/dedup:k1");
                then.status(200).json_body(serde_json::json!({"result": "1"}));
            })
            .await;

        let outcome = kv.dedup().check_and_mark("k1", 300).await.expect("outcome");
        assert_eq!(outcome, DedupOutcome::Duplicate);
    }

    #[tokio::test]
    async fn dead_letter_persists_payload_error_and_time() {
        let server = MockServer::start_async().await;
        let kv = store(&server);
        let failed_at = "2024-05-01T12:00:00Z"
            .parse::<DateTime<Utc>>()
            .expect("timestamp");

        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/set/dlq:whatsapp:abc123")
                    .query_param("ex", "86400")
                    .body_contains("\"error\":\"upstream returned 500\"")
                    .body_contains("2024-05-01T12:00:00+00:00");
                then.status(200).json_body(serde_json::json!({"result": "OK"}));
            })
            .await;

        kv.dead_letters()
            .record(
                &DeadLetterRecord {
                    channel: "whatsapp",
                    idempotency_key: "abc123",
                    payload: &serde_json::json!({"text": "hi"}),
                    error: "upstream returned 500",
                    failed_at,
                },
                86_400,
            )
            .await
            .expect("record");
        mock.assert_async().await;
    }
}
