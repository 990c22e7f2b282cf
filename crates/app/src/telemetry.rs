use chrono::{DateTime, Utc};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{
    BuildError as PrometheusBuildError, PrometheusBuilder, PrometheusHandle,
};
use serde::Serialize;
use std::{
    fmt as stdfmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, OnceLock,
    },
    time::Instant,
};
use tracing_subscriber::{
    fmt::{self as tracing_fmt, time::UtcTime},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use im_gateway_core::types::Channel;
use im_gateway_util::{AppConfig, Environment};

#[derive(Debug)]
pub enum TelemetryError {
    Tracing(tracing_subscriber::util::TryInitError),
    Metrics(PrometheusBuildError),
}

impl stdfmt::Display for TelemetryError {
    fn fmt(&self, f: &mut stdfmt::Formatter<'_>) -> stdfmt::Result {
        match self {
            Self::Tracing(err) => write!(f, "failed to initialize tracing: {err}"),
            Self::Metrics(err) => write!(f, "failed to initialize prometheus recorder: {err}"),
        }
    }
}

impl std::error::Error for TelemetryError {}

impl From<tracing_subscriber::util::TryInitError> for TelemetryError {
    fn from(value: tracing_subscriber::util::TryInitError) -> Self {
        Self::Tracing(value)
    }
}

impl From<PrometheusBuildError> for TelemetryError {
    fn from(value: PrometheusBuildError) -> Self {
        Self::Metrics(value)
    }
}

static TRACING_INIT: OnceLock<()> = OnceLock::new();
static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static METRICS_INSTALL_GUARD: OnceLock<Mutex<()>> = OnceLock::new();
static START_TIME: OnceLock<Instant> = OnceLock::new();

const BUILD_VERSION: &str = env!("CARGO_PKG_VERSION");

fn build_git_sha() -> &'static str {
    option_env!("GIT_SHA").unwrap_or("unknown")
}

pub fn init_tracing(config: &AppConfig) -> Result<(), TelemetryError> {
    if TRACING_INIT.get().is_some() {
        return Ok(());
    }

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match config.environment {
        Environment::Development | Environment::Test => {
            let fmt_layer = tracing_fmt::layer()
                .with_target(false)
                .with_level(true)
                .with_thread_ids(false)
                .with_thread_names(false)
                .with_timer(UtcTime::rfc_3339())
                .event_format(tracing_fmt::format().pretty());

            tracing_subscriber::registry()
                .with(env_filter.clone())
                .with(fmt_layer)
                .try_init()
                .map_err(TelemetryError::Tracing)?;
        }
        Environment::Production => {
            let fmt_layer = tracing_fmt::layer()
                .with_target(false)
                .with_level(true)
                .with_thread_ids(false)
                .with_thread_names(false)
                .with_timer(UtcTime::rfc_3339())
                .json();

            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt_layer)
                .try_init()
                .map_err(TelemetryError::Tracing)?;
        }
    }

    TRACING_INIT.set(()).ok();
    tracing::info!(stage = "telemetry", env = %config.environment.as_str(), version = BUILD_VERSION, git_sha = build_git_sha(), "tracing initialized");
    Ok(())
}

pub fn init_metrics() -> Result<PrometheusHandle, TelemetryError> {
    if let Some(handle) = METRICS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let guard = METRICS_INSTALL_GUARD
        .get_or_init(|| Mutex::new(()))
        .lock()
        .expect("metrics install guard poisoned");

    if let Some(handle) = METRICS_HANDLE.get() {
        drop(guard);
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    METRICS_HANDLE.set(handle.clone()).ok();
    drop(guard);

    describe_gauge!("app_build_info", "Build metadata for the running binary");
    describe_gauge!("app_uptime_seconds", "Seconds since the process started");
    describe_counter!(
        "webhook_requests_total",
        "Count of webhook requests handled, labelled by channel"
    );
    describe_counter!(
        "webhook_signature_failures_total",
        "Count of webhook requests rejected due to invalid signatures"
    );
    describe_counter!(
        "webhook_rate_limited_total",
        "Count of webhook requests denied by the per-IP rate limiter"
    );
    describe_counter!(
        "webhook_dedup_hits_total",
        "Count of webhook requests short-circuited as duplicates"
    );
    describe_counter!(
        "upstream_forward_total",
        "Count of completed forward loops, labelled by result"
    );
    describe_counter!(
        "dead_letters_total",
        "Count of payloads persisted to the dead-letter store"
    );
    describe_histogram!(
        "webhook_response_seconds",
        "Latency in seconds to answer webhook requests, labelled by channel"
    );
    START_TIME.get_or_init(Instant::now);

    Ok(handle)
}

pub fn render_metrics(handle: &PrometheusHandle) -> String {
    let mut body = handle.render();
    if !body.is_empty() && !body.ends_with('\n') {
        body.push('\n');
    }

    body.push_str("# TYPE app_build_info gauge\n");
    body.push_str(&format!(
        "app_build_info{{version=\"{}\",git=\"{}\"}} 1\n",
        BUILD_VERSION,
        build_git_sha()
    ));

    let uptime = START_TIME
        .get()
        .map(|start| start.elapsed().as_secs_f64())
        .unwrap_or_default();
    body.push_str("# TYPE app_uptime_seconds gauge\n");
    body.push_str(&format!("app_uptime_seconds {}\n", uptime));

    body
}

/// Process-lifetime advisory counters behind `GET /metrics`.
///
/// Lives exactly as long as the process: created at cold start, reset to
/// zero whenever the execution environment is recycled. Telemetry only —
/// the Prometheus recorder is the durable path, this snapshot is a cheap
/// liveness view.
pub struct MetricsState {
    started_at: DateTime<Utc>,
    requests_total: AtomicU64,
    whatsapp: AtomicU64,
    telegram: AtomicU64,
    line: AtomicU64,
    messenger: AtomicU64,
    signature_failures: AtomicU64,
    rate_limited: AtomicU64,
    dedup_hits: AtomicU64,
    upstream_successes: AtomicU64,
    upstream_errors: AtomicU64,
    dead_letters: AtomicU64,
}

impl MetricsState {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            requests_total: AtomicU64::new(0),
            whatsapp: AtomicU64::new(0),
            telegram: AtomicU64::new(0),
            line: AtomicU64::new(0),
            messenger: AtomicU64::new(0),
            signature_failures: AtomicU64::new(0),
            rate_limited: AtomicU64::new(0),
            dedup_hits: AtomicU64::new(0),
            upstream_successes: AtomicU64::new(0),
            upstream_errors: AtomicU64::new(0),
            dead_letters: AtomicU64::new(0),
        }
    }

    pub fn record_request(&self, channel: Channel) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        self.channel_slot(channel).fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_signature_failure(&self) {
        self.signature_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rate_limited(&self) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dedup_hit(&self) {
        self.dedup_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_upstream_success(&self) {
        self.upstream_successes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_upstream_error(&self) {
        self.upstream_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dead_letter(&self) {
        self.dead_letters.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            channels: ChannelCounts {
                whatsapp: self.whatsapp.load(Ordering::Relaxed),
                telegram: self.telegram.load(Ordering::Relaxed),
                line: self.line.load(Ordering::Relaxed),
                messenger: self.messenger.load(Ordering::Relaxed),
            },
            signature_failures: self.signature_failures.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            dedup_hits: self.dedup_hits.load(Ordering::Relaxed),
            upstream_successes: self.upstream_successes.load(Ordering::Relaxed),
            upstream_errors: self.upstream_errors.load(Ordering::Relaxed),
            dead_letters: self.dead_letters.load(Ordering::Relaxed),
            last_reset: self.started_at,
        }
    }

    fn channel_slot(&self, channel: Channel) -> &AtomicU64 {
        match channel {
            Channel::Whatsapp => &self.whatsapp,
            Channel::Telegram => &self.telegram,
            Channel::Line => &self.line,
            Channel::Messenger => &self.messenger,
        }
    }
}

impl Default for MetricsState {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub requests_total: u64,
    pub channels: ChannelCounts,
    pub signature_failures: u64,
    pub rate_limited: u64,
    pub dedup_hits: u64,
    pub upstream_successes: u64,
    pub upstream_errors: u64,
    pub dead_letters: u64,
    pub last_reset: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct ChannelCounts {
    pub whatsapp: u64,
    pub telegram: u64,
    pub line: u64,
    pub messenger: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_recorded_counts() {
        let state = MetricsState::new();
        state.record_request(Channel::Whatsapp);
        state.record_request(Channel::Whatsapp);
        state.record_request(Channel::Telegram);
        state.record_signature_failure();
        state.record_dedup_hit();
        state.record_upstream_success();
        state.record_dead_letter();

        let snapshot = state.snapshot();
        assert_eq!(snapshot.requests_total, 3);
        assert_eq!(snapshot.channels.whatsapp, 2);
        assert_eq!(snapshot.channels.telegram, 1);
        assert_eq!(snapshot.channels.line, 0);
        assert_eq!(snapshot.signature_failures, 1);
        assert_eq!(snapshot.dedup_hits, 1);
        assert_eq!(snapshot.upstream_successes, 1);
        assert_eq!(snapshot.dead_letters, 1);
    }

    #[test]
    fn snapshot_serializes_with_last_reset() {
        let state = MetricsState::new();
        let json = serde_json::to_value(state.snapshot()).expect("serialize");
        assert!(json.get("last_reset").is_some());
        assert_eq!(json["requests_total"], 0);
        assert!(json["channels"].get("messenger").is_some());
    }
}
