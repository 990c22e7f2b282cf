use std::{env, fmt, net::SocketAddr};

/// Listen address used when `APP_BIND_ADDR` is not set. The gateway sits
/// behind an edge proxy, so it binds all interfaces by default.
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8787";

/// Resolves the listen address from `APP_BIND_ADDR`, falling back to
/// [`DEFAULT_BIND_ADDR`].
pub fn server_bind_address() -> Result<SocketAddr, std::net::AddrParseError> {
    env::var("APP_BIND_ADDR")
        .unwrap_or_else(|_| DEFAULT_BIND_ADDR.to_string())
        .parse()
}

/// Application runtime environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
    Test,
}

impl Environment {
    fn from_str(value: &str) -> Result<Self, ConfigError> {
        match value {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            "test" => Ok(Self::Test),
            other => Err(ConfigError::InvalidEnvironment(other.to_string())),
        }
    }

    /// Returns `true` when the current environment should behave as development.
    pub fn is_development(self) -> bool {
        matches!(self, Self::Development)
    }

    /// Returns the canonical name used for logging/metrics labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Test => "test",
        }
    }
}

/// Runtime configuration for the HTTP server itself.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub environment: Environment,
}

impl AppConfig {
    /// Constructs the configuration by reading and validating environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let env_value = env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());
        let environment = Environment::from_str(&env_value)?;
        let bind_addr = server_bind_address().map_err(ConfigError::BindAddress)?;

        Ok(Self {
            bind_addr,
            environment,
        })
    }
}

/// Gateway configuration: downstream API, KV binding, per-channel secrets,
/// and the admission/retry knobs.
///
/// Channel secrets are optional on purpose — a channel with no secret
/// configured fails verification for every request rather than failing
/// startup, so one misconfigured platform cannot take the gateway down.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub api_url: String,
    pub kv_url: String,
    pub kv_token: Option<String>,
    pub whatsapp_app_secret: Option<String>,
    pub whatsapp_verify_token: Option<String>,
    pub telegram_secret_token: Option<String>,
    pub line_channel_secret: Option<String>,
    pub messenger_app_secret: Option<String>,
    pub messenger_verify_token: Option<String>,
    pub rate_limit_per_minute: u32,
    pub dedup_ttl_secs: u64,
    pub dead_letter_ttl_secs: u64,
    pub max_retries: u32,
    pub retry_base_ms: u64,
    pub upstream_timeout_ms: u64,
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            api_url: require_var("API_URL")?,
            kv_url: require_var("KV_REST_URL")?,
            kv_token: optional_var("KV_REST_TOKEN"),
            whatsapp_app_secret: optional_var("WHATSAPP_APP_SECRET"),
            whatsapp_verify_token: optional_var("WHATSAPP_VERIFY_TOKEN"),
            telegram_secret_token: optional_var("TELEGRAM_SECRET_TOKEN"),
            line_channel_secret: optional_var("LINE_CHANNEL_SECRET"),
            messenger_app_secret: optional_var("MESSENGER_APP_SECRET"),
            messenger_verify_token: optional_var("MESSENGER_VERIFY_TOKEN"),
            rate_limit_per_minute: number_var("RATE_LIMIT_PER_MINUTE", 120)?,
            dedup_ttl_secs: number_var("DEDUP_TTL_SECS", 300)?,
            dead_letter_ttl_secs: number_var("DEAD_LETTER_TTL_SECS", 86_400)?,
            max_retries: number_var("MAX_RETRIES", 2)?,
            retry_base_ms: number_var("RETRY_BASE_MS", 500)?,
            upstream_timeout_ms: number_var("UPSTREAM_TIMEOUT_MS", 15_000)?,
        })
    }
}

fn require_var(name: &'static str) -> Result<String, ConfigError> {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ConfigError::MissingVar(name)),
    }
}

fn optional_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

fn number_var<T>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
{
    match env::var(name) {
        Ok(raw) => raw.trim().parse::<T>().map_err(|_| ConfigError::InvalidNumber {
            name,
            value: raw,
        }),
        Err(_) => Ok(default),
    }
}

/// Errors that can occur during configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    InvalidEnvironment(String),
    BindAddress(std::net::AddrParseError),
    MissingVar(&'static str),
    InvalidNumber { name: &'static str, value: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEnvironment(value) => write!(
                f,
                "APP_ENV must be one of 'development', 'production', or 'test' (got {value})"
            ),
            Self::BindAddress(err) => write!(f, "invalid APP_BIND_ADDR value: {err}"),
            Self::MissingVar(name) => write!(f, "required environment variable {name} is not set"),
            Self::InvalidNumber { name, value } => {
                write!(f, "{name} must be a number (got {value})")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{LazyLock, Mutex};

    static ENV_GUARD: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    const GATEWAY_VARS: [&str; 15] = [
        "API_URL",
        "KV_REST_URL",
        "KV_REST_TOKEN",
        "WHATSAPP_APP_SECRET",
        "WHATSAPP_VERIFY_TOKEN",
        "TELEGRAM_SECRET_TOKEN",
        "LINE_CHANNEL_SECRET",
        "MESSENGER_APP_SECRET",
        "MESSENGER_VERIFY_TOKEN",
        "RATE_LIMIT_PER_MINUTE",
        "DEDUP_TTL_SECS",
        "DEAD_LETTER_TTL_SECS",
        "MAX_RETRIES",
        "RETRY_BASE_MS",
        "UPSTREAM_TIMEOUT_MS",
    ];

    fn clear_gateway_vars() {
        for name in GATEWAY_VARS {
            env::remove_var(name);
        }
    }

    #[test]
    fn loads_defaults_in_development() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        env::remove_var("APP_ENV");
        env::remove_var("APP_BIND_ADDR");

        let config = AppConfig::from_env().expect("config should load with defaults");
        assert_eq!(config.environment, Environment::Development);
        assert_eq!(config.bind_addr.to_string(), DEFAULT_BIND_ADDR);
    }

    #[test]
    fn bind_address_defaults_to_all_interfaces() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        env::remove_var("APP_BIND_ADDR");
        let addr = server_bind_address().expect("default address is valid");
        assert_eq!(addr.to_string(), DEFAULT_BIND_ADDR);
    }

    #[test]
    fn bind_address_honors_override() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        env::set_var("APP_BIND_ADDR", "127.0.0.1:9000");
        let addr = server_bind_address().expect("custom address should parse");
        assert_eq!(addr.to_string(), "127.0.0.1:9000");
        env::remove_var("APP_BIND_ADDR");
    }

    #[test]
    fn rejects_invalid_environment() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        env::set_var("APP_ENV", "invalid");

        let err = AppConfig::from_env().expect_err("invalid env should error");
        assert!(matches!(err, ConfigError::InvalidEnvironment(value) if value == "invalid"));

        env::remove_var("APP_ENV");
    }

    #[test]
    fn gateway_config_applies_numeric_defaults() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_gateway_vars();
        env::set_var("API_URL", "https://api.example.com/");
        env::set_var("KV_REST_URL", "https://kv.example.com/");

        let config = GatewayConfig::from_env().expect("config should load");
        assert_eq!(config.rate_limit_per_minute, 120);
        assert_eq!(config.dedup_ttl_secs, 300);
        assert_eq!(config.dead_letter_ttl_secs, 86_400);
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.retry_base_ms, 500);
        assert_eq!(config.upstream_timeout_ms, 15_000);
        assert_eq!(config.kv_token, None);
        assert_eq!(config.telegram_secret_token, None);

        clear_gateway_vars();
    }

    #[test]
    fn gateway_config_requires_api_and_kv_urls() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_gateway_vars();

        let err = GatewayConfig::from_env().expect_err("missing API_URL should error");
        assert!(matches!(err, ConfigError::MissingVar("API_URL")));

        env::set_var("API_URL", "https://api.example.com/");
        let err = GatewayConfig::from_env().expect_err("missing KV_REST_URL should error");
        assert!(matches!(err, ConfigError::MissingVar("KV_REST_URL")));

        clear_gateway_vars();
    }

    #[test]
    fn gateway_config_rejects_non_numeric_knobs() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_gateway_vars();
        env::set_var("API_URL", "https://api.example.com/");
        env::set_var("KV_REST_URL", "https://kv.example.com/");
        env::set_var("MAX_RETRIES", "lots");

        let err = GatewayConfig::from_env().expect_err("bad number should error");
        assert!(matches!(
            err,
            ConfigError::InvalidNumber {
                name: "MAX_RETRIES",
                ..
            }
        ));

        clear_gateway_vars();
    }

    #[test]
    fn gateway_config_reads_secrets_and_overrides() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_gateway_vars();
        env::set_var("API_URL", "https://api.example.com/");
        env::set_var("KV_REST_URL", "https://kv.example.com/");
        env::set_var("KV_REST_TOKEN", "kv-token");
        env::set_var("TELEGRAM_SECRET_TOKEN", "tg-token");
        env::set_var("RATE_LIMIT_PER_MINUTE", "10");

        let config = GatewayConfig::from_env().expect("config should load");
        assert_eq!(config.kv_token.as_deref(), Some("kv-token"));
        assert_eq!(config.telegram_secret_token.as_deref(), Some("tg-token"));
        assert_eq!(config.rate_limit_per_minute, 10);

        clear_gateway_vars();
    }
}
