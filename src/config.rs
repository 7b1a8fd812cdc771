//! Process configuration, loaded once at startup from the environment.
//!
//! The distilled specification names a fixed set of recognized environment
//! variables rather than a settings file, so this module reads them eagerly
//! in `main` the way the teacher's `Settings::load` reads its TOML file
//! once on launch — there is no per-request re-read.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub upstream_base_url: String,
    pub listen_addr: String,
    pub listen_port: u16,
    pub db_path: String,
    pub default_max_attempts: u32,
    pub default_attempt_timeout: Duration,
    pub default_request_timeout: Duration,
    pub rng_seed: Option<u64>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(
    name: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Err(_) => Ok(default),
        Ok(raw) => raw.parse::<T>().map_err(|_| ConfigError::Invalid {
            name,
            value: raw,
        }),
    }
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let upstream_base_url = std::env::var("GATEWAY_UPSTREAM_BASE_URL")
            .map_err(|_| ConfigError::Missing("GATEWAY_UPSTREAM_BASE_URL"))?;

        let listen_addr = env_or("GATEWAY_LISTEN_ADDR", "127.0.0.1");
        let listen_port: u16 = env_parse("GATEWAY_LISTEN_PORT", 8787)?;
        let db_path = env_or("GATEWAY_DB_PATH", "gateway.db");
        let default_max_attempts: u32 = env_parse("GATEWAY_DEFAULT_MAX_ATTEMPTS", 3)?;
        let attempt_secs: u64 = env_parse("GATEWAY_DEFAULT_ATTEMPT_TIMEOUT_SECS", 120)?;
        let request_secs: u64 = env_parse("GATEWAY_DEFAULT_REQUEST_TIMEOUT_SECS", 600)?;
        let rng_seed: Option<u64> = match std::env::var("GATEWAY_RNG_SEED") {
            Err(_) => None,
            Ok(raw) => Some(raw.parse().map_err(|_| ConfigError::Invalid {
                name: "GATEWAY_RNG_SEED",
                value: raw,
            })?),
        };

        Ok(Self {
            upstream_base_url,
            listen_addr,
            listen_port,
            db_path,
            default_max_attempts,
            default_attempt_timeout: Duration::from_secs(attempt_secs),
            default_request_timeout: Duration::from_secs(request_secs),
            rng_seed,
        })
    }

    pub fn log_level(&self) -> String {
        env_or("GATEWAY_LOG_LEVEL", "info")
    }
}
