//! Application configuration

use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use mcphub_shared::ReconnectPolicy;

use crate::mcp::ManagerSettings;
use crate::reconnect::ReconnectLimits;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    // Server
    pub bind_address: SocketAddr,
    pub settings_path: String,

    // Upstream MCP
    pub mcp_init_timeout_ms: u64,
    pub mcp_request_timeout_ms: u64,
    pub mcp_keepalive_interval_ms: u64,
    pub upstream_reconnect: ReconnectPolicy,
    pub startup_settle_ms: u64,

    // Endpoint bridge
    pub endpoint_aggressive_reconnect: bool,
    pub endpoint_reconnect_interval_ms: u64,
    pub endpoint_max_infinite_retries: u32,
    pub endpoint_sleep_threshold: u32,
    pub endpoint_sleep_interval_ms: u64,
}

/// Parse an environment variable, falling back to `default` when unset or unparseable
fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "Unparseable environment value, using default");
            default
        }),
        Err(_) => default,
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let bind_address = env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
        let bind_address = bind_address
            .parse()
            .map_err(|_| ConfigError::Invalid("BIND_ADDRESS", bind_address))?;

        let defaults = ReconnectPolicy::default();
        let upstream_reconnect = ReconnectPolicy {
            max_attempts: env_or("UPSTREAM_RECONNECT_MAX_ATTEMPTS", defaults.max_attempts),
            initial_delay: env_or("UPSTREAM_RECONNECT_INITIAL_DELAY_MS", defaults.initial_delay),
            max_delay: env_or("UPSTREAM_RECONNECT_MAX_DELAY_MS", defaults.max_delay),
            backoff_multiplier: env_or(
                "UPSTREAM_RECONNECT_BACKOFF_MULTIPLIER",
                defaults.backoff_multiplier,
            ),
            infinite_reconnect: env_or("UPSTREAM_RECONNECT_INFINITE", defaults.infinite_reconnect),
            infinite_retry_delay: env_or(
                "UPSTREAM_RECONNECT_INFINITE_DELAY_MS",
                defaults.infinite_retry_delay,
            ),
        };

        Ok(Self {
            bind_address,
            settings_path: env::var("MCPHUB_SETTINGS_PATH")
                .unwrap_or_else(|_| "mcp_settings.json".to_string()),

            mcp_init_timeout_ms: env_or("MCP_INIT_TIMEOUT_MS", 60_000),
            mcp_request_timeout_ms: env_or("MCP_REQUEST_TIMEOUT_MS", 60_000),
            mcp_keepalive_interval_ms: env_or("MCP_KEEPALIVE_INTERVAL_MS", 60_000),
            upstream_reconnect,
            startup_settle_ms: env_or("MCPHUB_STARTUP_SETTLE_MS", 30_000),

            endpoint_aggressive_reconnect: env_or("ENDPOINT_AGGRESSIVE_RECONNECT", false),
            endpoint_reconnect_interval_ms: env_or("ENDPOINT_RECONNECT_INTERVAL_MS", 2_000),
            endpoint_max_infinite_retries: env_or("ENDPOINT_MAX_INFINITE_RETRIES", 48),
            endpoint_sleep_threshold: env_or("ENDPOINT_SLEEP_THRESHOLD", 12),
            endpoint_sleep_interval_ms: env_or("ENDPOINT_SLEEP_INTERVAL_MS", 7_200_000),
        })
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.mcp_init_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.mcp_request_timeout_ms)
    }

    pub fn startup_settle(&self) -> Duration {
        Duration::from_millis(self.startup_settle_ms)
    }

    /// Retry and keep-alive settings for upstream backends
    pub fn manager_settings(&self) -> ManagerSettings {
        ManagerSettings {
            reconnect: self.upstream_reconnect.clone(),
            limits: ReconnectLimits::default(),
            keep_alive: Duration::from_millis(self.mcp_keepalive_interval_ms.max(1_000)),
        }
    }

    /// Limits applied next to each endpoint's own policy
    pub fn endpoint_limits(&self) -> ReconnectLimits {
        ReconnectLimits {
            sleep_threshold: self.endpoint_sleep_threshold,
            sleep_interval: Duration::from_millis(self.endpoint_sleep_interval_ms),
            max_infinite_retries: Some(self.endpoint_max_infinite_retries),
            aggressive_interval: self
                .endpoint_aggressive_reconnect
                .then(|| Duration::from_millis(self.endpoint_reconnect_interval_ms)),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    Invalid(&'static str, String),
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serial_test::serial;

    const KEYS: &[&str] = &[
        "BIND_ADDRESS",
        "MCP_REQUEST_TIMEOUT_MS",
        "UPSTREAM_RECONNECT_MAX_ATTEMPTS",
        "ENDPOINT_AGGRESSIVE_RECONNECT",
        "ENDPOINT_RECONNECT_INTERVAL_MS",
        "ENDPOINT_MAX_INFINITE_RETRIES",
    ];

    fn cleanup_config() {
        for key in KEYS {
            env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn test_defaults() {
        cleanup_config();

        let config = Config::from_env().unwrap();
        assert_eq!(config.bind_address, "0.0.0.0:3000".parse::<SocketAddr>().unwrap());
        assert_eq!(config.request_timeout(), Duration::from_secs(60));
        assert_eq!(config.upstream_reconnect, ReconnectPolicy::default());

        let limits = config.endpoint_limits();
        assert_eq!(limits.max_infinite_retries, Some(48));
        assert_eq!(limits.sleep_threshold, 12);
        assert_eq!(limits.sleep_interval, Duration::from_secs(2 * 60 * 60));
        assert_eq!(limits.aggressive_interval, None);
    }

    #[test]
    #[serial]
    fn test_overrides_and_fallbacks() {
        cleanup_config();
        env::set_var("MCP_REQUEST_TIMEOUT_MS", "1500");
        env::set_var("UPSTREAM_RECONNECT_MAX_ATTEMPTS", "not-a-number");
        env::set_var("ENDPOINT_AGGRESSIVE_RECONNECT", "true");
        env::set_var("ENDPOINT_RECONNECT_INTERVAL_MS", "500");

        let config = Config::from_env().unwrap();
        assert_eq!(config.request_timeout(), Duration::from_millis(1500));
        assert_eq!(config.upstream_reconnect.max_attempts, 10);
        assert_eq!(
            config.endpoint_limits().aggressive_interval,
            Some(Duration::from_millis(500))
        );

        cleanup_config();
    }

    #[test]
    #[serial]
    fn test_invalid_bind_address() {
        cleanup_config();
        env::set_var("BIND_ADDRESS", "not an address");

        let result = Config::from_env();
        assert!(matches!(result, Err(ConfigError::Invalid("BIND_ADDRESS", _))));

        cleanup_config();
    }
}
