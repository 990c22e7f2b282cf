mod problem;
mod router;
mod telemetry;
mod webhook;

use std::net::SocketAddr;
use std::time::Duration;

use tracing::info;
use url::Url;

use im_gateway_core::verifier::ChannelSecrets;
use im_gateway_kv::KvStore;
use im_gateway_upstream::{ForwardPolicy, UpstreamClient};
use im_gateway_util::{load_env_file, AppConfig, GatewayConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    load_env_file();
    let config = AppConfig::from_env()?;
    let gateway = GatewayConfig::from_env()?;

    telemetry::init_tracing(&config)?;
    let metrics = telemetry::init_metrics()?;

    let http = reqwest::Client::builder()
        .timeout(Duration::from_millis(gateway.upstream_timeout_ms))
        .build()?;

    let kv = KvStore::new(
        ensure_trailing_slash(&gateway.kv_url)?,
        gateway.kv_token.clone(),
        http.clone(),
    );
    let upstream = UpstreamClient::new(ensure_trailing_slash(&gateway.api_url)?, http)?;

    let secrets = ChannelSecrets {
        whatsapp_app_secret: gateway.whatsapp_app_secret,
        whatsapp_verify_token: gateway.whatsapp_verify_token,
        telegram_secret_token: gateway.telegram_secret_token,
        line_channel_secret: gateway.line_channel_secret,
        messenger_app_secret: gateway.messenger_app_secret,
        messenger_verify_token: gateway.messenger_verify_token,
    };
    let limits = router::GatewayLimits {
        rate_limit_per_minute: gateway.rate_limit_per_minute,
        dedup_ttl_secs: gateway.dedup_ttl_secs,
        dead_letter_ttl_secs: gateway.dead_letter_ttl_secs,
    };
    let forward_policy = ForwardPolicy {
        max_retries: gateway.max_retries,
        retry_base: Duration::from_millis(gateway.retry_base_ms),
        attempt_timeout: Duration::from_millis(gateway.upstream_timeout_ms),
    };

    let state = router::AppState::new(metrics, kv, upstream, secrets, limits, forward_policy);

    let addr: SocketAddr = config.bind_addr;
    info!(stage = "app", %addr, env = %config.environment.as_str(), "starting webhook gateway");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router::app_router(state))
        .await
        .map_err(|err| err.into())
}

/// `Url::join` drops the last path segment of a base without a trailing
/// slash, so base URLs get one appended before any joins happen.
fn ensure_trailing_slash(raw: &str) -> Result<Url, url::ParseError> {
    if raw.ends_with('/') {
        Url::parse(raw)
    } else {
        Url::parse(&format!("{raw}/"))
    }
}
