//! Process configuration, read once from the environment at startup.

use std::env;
use std::time::Duration;

use parley_call::ice::IceServer;

pub const DEFAULT_TOKEN_SECRET: &str = "insecure-dev-secret";

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// Absent means single-process mode on the in-memory bus.
    pub redis_url: Option<String>,
    pub token_secret: String,
    pub token_issuer: Option<String>,
    pub token_audience: Option<String>,
    /// Base URL of the job-board CRUD service; absent means an empty
    /// directory (every join is rejected as not-found).
    pub directory_url: Option<String>,
    pub directory_token: Option<String>,
    pub bus_connect_timeout: Duration,
    pub heartbeat_timeout: Duration,
    pub ice_provider_url: Option<String>,
    pub ice_provider_secret: Option<String>,
    pub ice_static_servers: Vec<IceServer>,
    pub ice_cache_ttl: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            redis_url: None,
            token_secret: DEFAULT_TOKEN_SECRET.to_string(),
            token_issuer: None,
            token_audience: None,
            directory_url: None,
            directory_token: None,
            bus_connect_timeout: Duration::from_millis(3000),
            heartbeat_timeout: Duration::from_secs(600),
            ice_provider_url: None,
            ice_provider_secret: None,
            ice_static_servers: Vec::new(),
            ice_cache_ttl: Duration::from_secs(60),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            port: env_parse("PARLEY_PORT").unwrap_or(defaults.port),
            redis_url: env_opt("REDIS_URL"),
            token_secret: env_opt("PARLEY_TOKEN_SECRET").unwrap_or(defaults.token_secret),
            token_issuer: env_opt("PARLEY_TOKEN_ISSUER"),
            token_audience: env_opt("PARLEY_TOKEN_AUDIENCE"),
            directory_url: env_opt("DIRECTORY_URL"),
            directory_token: env_opt("DIRECTORY_TOKEN"),
            bus_connect_timeout: env_parse("BUS_CONNECT_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.bus_connect_timeout),
            heartbeat_timeout: env_parse("HEARTBEAT_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.heartbeat_timeout),
            ice_provider_url: env_opt("ICE_PROVIDER_URL"),
            ice_provider_secret: env_opt("ICE_PROVIDER_SECRET"),
            ice_static_servers: env_opt("ICE_STATIC_SERVERS")
                .map(|raw| parse_static_servers(&raw))
                .unwrap_or_default(),
            ice_cache_ttl: env_parse("ICE_CACHE_TTL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.ice_cache_ttl),
        }
    }
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_opt(key).and_then(|value| value.parse().ok())
}

/// Comma-separated URL list; credentials come from the provider path, so
/// static entries are credential-less STUN/TURN urls.
fn parse_static_servers(raw: &str) -> Vec<IceServer> {
    raw.split(',')
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .map(IceServer::stun)
        .collect()
}
