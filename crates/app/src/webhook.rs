//! The webhook ingestion pipeline: admission, verification, normalization,
//! dedup, forward, and dead-letter fallback, in that order.
//!
//! The handler accepts every method so the rate limiter runs before method
//! dispatch; a flood of bogus GETs burns the sender's budget just like
//! POSTs do.

use std::time::Instant;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use im_gateway_core::normalizer::Normalizer;
use im_gateway_core::types::{Channel, NormalizedWebhookPayload};
use im_gateway_core::verifier::timing_safe_eq;
use im_gateway_kv::{DeadLetterRecord, DedupOutcome};
use im_gateway_upstream::ForwardOutcome;

use crate::problem::ErrorResponse;
use crate::router::{cors_preflight, AppState};

pub async fn handle(
    State(state): State<AppState>,
    Path(channel): Path<String>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if method == Method::OPTIONS {
        return cors_preflight();
    }
    let Some(channel) = Channel::from_path(&channel) else {
        return ErrorResponse::new(StatusCode::NOT_FOUND, "unknown_channel").into_response();
    };

    let started = Instant::now();
    state.stats().record_request(channel);
    counter!("webhook_requests_total", "channel" => channel.metric_label()).increment(1);

    let now = state.now();
    let ip = client_ip(&headers);
    let bucket = now.timestamp_millis().div_euclid(60_000);
    let limit = state.limits().rate_limit_per_minute;
    let remaining = match state
        .kv()
        .rate_limits()
        .check_and_increment(&ip, bucket, limit)
        .await
    {
        Ok(decision) if decision.allowed => decision.remaining,
        Ok(_) => {
            state.stats().record_rate_limited();
            counter!("webhook_rate_limited_total", "channel" => channel.metric_label())
                .increment(1);
            info!(
                stage = "rate_limit",
                channel = channel.as_str(),
                ip = %ip,
                "request denied by rate limiter"
            );
            let response = ErrorResponse::new(StatusCode::TOO_MANY_REQUESTS, "rate_limit_exceeded")
                .with_retry_after(60)
                .into_response();
            return finalize(response, channel, 0, started);
        }
        // The limiter is advisory. When the KV store is down the gateway
        // keeps ingesting rather than dropping real platform traffic.
        Err(err) => {
            warn!(
                stage = "rate_limit",
                channel = channel.as_str(),
                error = %err,
                "rate limiter unavailable, admitting request"
            );
            limit
        }
    };

    let response = match method {
        Method::GET if channel.supports_challenge() => challenge(&state, channel, &uri),
        Method::POST => ingest(&state, channel, &headers, &body, now).await,
        _ => {
            ErrorResponse::new(StatusCode::METHOD_NOT_ALLOWED, "method_not_allowed")
                .into_response()
        }
    };
    finalize(response, channel, remaining, started)
}

#[derive(Debug, Default, Deserialize)]
struct ChallengeQuery {
    #[serde(rename = "hub.mode")]
    mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    challenge: Option<String>,
}

/// The Meta subscription handshake: echo `hub.challenge` verbatim when the
/// mode is `subscribe` and the verify token matches, 403 otherwise.
fn challenge(state: &AppState, channel: Channel, uri: &Uri) -> Response {
    let query = match Query::<ChallengeQuery>::try_from_uri(uri) {
        Ok(Query(query)) => query,
        Err(_) => ChallengeQuery::default(),
    };

    let token_ok = match (channel.verify_token(state.secrets()), query.verify_token) {
        (Some(expected), Some(provided)) => {
            timing_safe_eq(expected.as_bytes(), provided.as_bytes())
        }
        _ => false,
    };

    if query.mode.as_deref() == Some("subscribe") && token_ok {
        if let Some(challenge) = query.challenge.filter(|c| !c.is_empty()) {
            info!(
                stage = "challenge",
                channel = channel.as_str(),
                "subscription handshake verified"
            );
            return (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "text/plain")],
                challenge,
            )
                .into_response();
        }
    }

    state.stats().record_signature_failure();
    counter!("webhook_signature_failures_total", "channel" => channel.metric_label()).increment(1);
    ErrorResponse::new(StatusCode::FORBIDDEN, "verification_failed").into_response()
}

async fn ingest(
    state: &AppState,
    channel: Channel,
    headers: &HeaderMap,
    body: &Bytes,
    now: DateTime<Utc>,
) -> Response {
    if body.is_empty() {
        return ErrorResponse::new(StatusCode::BAD_REQUEST, "malformed_request")
            .with_detail("request body is empty")
            .into_response();
    }

    let signature = headers
        .get(channel.signature_header())
        .and_then(|value| value.to_str().ok());
    if !channel.verify(state.secrets(), signature, body) {
        state.stats().record_signature_failure();
        counter!("webhook_signature_failures_total", "channel" => channel.metric_label())
            .increment(1);
        warn!(
            stage = "verify",
            channel = channel.as_str(),
            header_present = signature.is_some(),
            "signature verification failed"
        );
        return ErrorResponse::new(StatusCode::UNAUTHORIZED, "unauthorized").into_response();
    }

    // A verified but unparseable body still gets forwarded; normalization
    // falls back to defaults and the idempotency key hashes the raw bytes.
    let raw = serde_json::from_slice::<Value>(body).unwrap_or(Value::Null);
    let extracted = Normalizer::normalize(channel, &raw);
    let payload = NormalizedWebhookPayload::assemble(channel, extracted, raw, body, now);

    match state
        .kv()
        .dedup()
        .check_and_mark(&payload.idempotency_key, state.limits().dedup_ttl_secs)
        .await
    {
        Ok(DedupOutcome::Duplicate) => {
            state.stats().record_dedup_hit();
            counter!("webhook_dedup_hits_total", "channel" => channel.metric_label()).increment(1);
            info!(
                stage = "dedup",
                channel = channel.as_str(),
                idempotency_key = %payload.idempotency_key,
                "duplicate delivery short-circuited"
            );
            return (
                StatusCode::OK,
                Json(json!({
                    "status": "duplicate",
                    "idempotency_key": payload.idempotency_key,
                })),
            )
                .into_response();
        }
        Ok(DedupOutcome::Fresh) => {}
        // A dedup outage must not drop messages; the worst case is the
        // downstream API seeing a delivery twice.
        Err(err) => {
            warn!(
                stage = "dedup",
                channel = channel.as_str(),
                idempotency_key = %payload.idempotency_key,
                error = %err,
                "dedup store unavailable, treating delivery as fresh"
            );
        }
    }

    match state
        .upstream()
        .forward(&payload, state.forward_policy())
        .await
    {
        ForwardOutcome::Delivered { status, body } => {
            state.stats().record_upstream_success();
            counter!("upstream_forward_total", "result" => "delivered").increment(1);
            passthrough(status, body)
        }
        ForwardOutcome::Rejected { status, body } => {
            state.stats().record_upstream_error();
            counter!("upstream_forward_total", "result" => "rejected").increment(1);
            warn!(
                stage = "forward",
                channel = channel.as_str(),
                idempotency_key = %payload.idempotency_key,
                status,
                "upstream rejected payload"
            );
            passthrough(status, body)
        }
        ForwardOutcome::Exhausted {
            attempts,
            last_error,
        } => {
            state.stats().record_upstream_error();
            counter!("upstream_forward_total", "result" => "exhausted").increment(1);
            error!(
                stage = "forward",
                channel = channel.as_str(),
                idempotency_key = %payload.idempotency_key,
                attempts,
                error = %last_error,
                "forward attempts exhausted, dead-lettering payload"
            );
            dead_letter(state, &payload, &last_error, now).await;

            (
                StatusCode::ACCEPTED,
                Json(json!({
                    "status": "accepted",
                    "queued": true,
                    "idempotency_key": payload.idempotency_key,
                })),
            )
                .into_response()
        }
    }
}

/// Persists the normalized payload for replay. A write failure is logged
/// and swallowed: the sender still gets a 202, the platform will redeliver.
async fn dead_letter(
    state: &AppState,
    payload: &NormalizedWebhookPayload,
    last_error: &str,
    now: DateTime<Utc>,
) {
    let stored = serde_json::to_value(payload).unwrap_or_else(|_| payload.raw.clone());
    let record = DeadLetterRecord {
        channel: payload.channel.as_str(),
        idempotency_key: &payload.idempotency_key,
        payload: &stored,
        error: last_error,
        failed_at: now,
    };

    match state
        .kv()
        .dead_letters()
        .record(&record, state.limits().dead_letter_ttl_secs)
        .await
    {
        Ok(()) => {
            state.stats().record_dead_letter();
            counter!("dead_letters_total", "channel" => payload.channel.metric_label())
                .increment(1);
        }
        Err(err) => {
            error!(
                stage = "dead_letter",
                channel = payload.channel.as_str(),
                idempotency_key = %payload.idempotency_key,
                error = %err,
                "failed to persist dead letter"
            );
        }
    }
}

/// Mirrors an upstream response back to the platform sender.
fn passthrough(status: u16, body: String) -> Response {
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::OK);
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        body,
    )
        .into_response()
}

fn finalize(mut response: Response, channel: Channel, remaining: u32, started: Instant) -> Response {
    let elapsed = started.elapsed();
    histogram!("webhook_response_seconds", "channel" => channel.metric_label())
        .record(elapsed.as_secs_f64());

    let headers = response.headers_mut();
    headers.insert("X-RateLimit-Remaining", HeaderValue::from(remaining));
    if let Ok(value) = HeaderValue::from_str(&format!("{}ms", elapsed.as_millis())) {
        headers.insert("X-Response-Time", value);
    }
    response
}

/// Edge deployments sit behind a proxy, so the connection address is the
/// proxy's. Trust the forwarding headers and fall back to a shared bucket.
fn client_ip(headers: &HeaderMap) -> String {
    if let Some(forwarded) = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    if let Some(real) = headers.get("x-real-ip").and_then(|value| value.to_str().ok()) {
        let real = real.trim();
        if !real.is_empty() {
            return real.to_string();
        }
    }
    "unknown".to_string()
}
