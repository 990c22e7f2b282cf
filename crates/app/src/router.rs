use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{header, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{any, get},
    Json, Router,
};
use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;

use im_gateway_core::types::Channel;
use im_gateway_core::verifier::ChannelSecrets;
use im_gateway_kv::KvStore;
use im_gateway_upstream::{ForwardPolicy, UpstreamClient};

use crate::problem::ErrorResponse;
use crate::telemetry::{self, MetricsState};
use crate::webhook;

/// Admission and retention knobs shared by the webhook pipeline.
#[derive(Debug, Clone)]
pub struct GatewayLimits {
    pub rate_limit_per_minute: u32,
    pub dedup_ttl_secs: u64,
    pub dead_letter_ttl_secs: u64,
}

#[derive(Clone)]
pub struct AppState {
    metrics: PrometheusHandle,
    stats: Arc<MetricsState>,
    kv: KvStore,
    upstream: UpstreamClient,
    secrets: Arc<ChannelSecrets>,
    limits: Arc<GatewayLimits>,
    forward_policy: Arc<ForwardPolicy>,
    clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>,
}

impl AppState {
    pub fn new(
        metrics: PrometheusHandle,
        kv: KvStore,
        upstream: UpstreamClient,
        secrets: ChannelSecrets,
        limits: GatewayLimits,
        forward_policy: ForwardPolicy,
    ) -> Self {
        Self {
            metrics,
            stats: Arc::new(MetricsState::new()),
            kv,
            upstream,
            secrets: Arc::new(secrets),
            limits: Arc::new(limits),
            forward_policy: Arc::new(forward_policy),
            clock: Arc::new(Utc::now),
        }
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>) -> Self {
        self.clock = clock;
        self
    }

    pub fn metrics(&self) -> &PrometheusHandle {
        &self.metrics
    }

    pub fn stats(&self) -> &MetricsState {
        &self.stats
    }

    pub fn kv(&self) -> &KvStore {
        &self.kv
    }

    pub fn upstream(&self) -> &UpstreamClient {
        &self.upstream
    }

    pub fn secrets(&self) -> &ChannelSecrets {
        &self.secrets
    }

    pub fn limits(&self) -> &GatewayLimits {
        &self.limits
    }

    pub fn forward_policy(&self) -> &ForwardPolicy {
        &self.forward_policy
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health).options(preflight))
        .route("/metrics", get(metrics_snapshot).options(preflight))
        .route("/metrics/prometheus", get(metrics_prometheus).options(preflight))
        .route("/webhook/:channel", any(webhook::handle))
        .fallback(fallback)
        .with_state(state)
}

/// Registered alongside every GET route so a preflight never hits the
/// method router's 405 default.
async fn preflight() -> Response {
    cors_preflight()
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let kv_available = state.kv().ping().await.is_ok();
    let channels: Vec<&str> = Channel::ALL.iter().map(|c| c.as_str()).collect();
    Json(json!({
        "status": "ok",
        "service": "im-gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": state.now().to_rfc3339(),
        "channels": channels,
        "kv_available": kv_available,
    }))
}

async fn metrics_snapshot(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.stats().snapshot())
}

async fn metrics_prometheus(State(state): State<AppState>) -> impl IntoResponse {
    let body = telemetry::render_metrics(state.metrics());
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/plain; version=0.0.4")
        .body(Body::from(body))
        .unwrap()
}

async fn fallback(method: Method) -> Response {
    if method == Method::OPTIONS {
        return cors_preflight();
    }
    ErrorResponse::new(StatusCode::NOT_FOUND, "not_found").into_response()
}

/// Signature headers are the only non-simple headers platforms send, so the
/// preflight allow-list names them explicitly.
const CORS_ALLOW_HEADERS: &str =
    "Content-Type, X-Hub-Signature-256, X-Telegram-Bot-Api-Secret-Token, X-Line-Signature";

pub(crate) fn cors_preflight() -> Response {
    Response::builder()
        .status(StatusCode::NO_CONTENT)
        .header("Access-Control-Allow-Origin", "*")
        .header("Access-Control-Allow-Methods", "GET,POST,OPTIONS")
        .header("Access-Control-Allow-Headers", CORS_ALLOW_HEADERS)
        .header("Access-Control-Max-Age", "86400")
        .body(Body::empty())
        .unwrap()
}
