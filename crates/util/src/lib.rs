//! Configuration surface for the gateway binary.
//!
//! Everything the process reads from its environment lives in
//! [`config`]: the listen address, the runtime environment, and the
//! gateway knobs ([`GatewayConfig`]) covering the downstream API, the KV
//! binding, per-channel secrets, and the admission/retry limits.

pub mod config;

pub use config::{
    server_bind_address, AppConfig, ConfigError, Environment, GatewayConfig, DEFAULT_BIND_ADDR,
};

/// Loads `.env` into the process environment when the file exists.
///
/// Absence is not an error: deployed gateways get their variables
/// injected by the platform, dotenv files exist only for local runs.
pub fn load_env_file() {
    let _ = dotenvy::dotenv();
}
