//! Client configuration loaded from environment variables.
//!
//! All settings have defaults so a session can open with zero configuration
//! against a local IPFS node.

use std::path::PathBuf;
use std::time::Duration;

use ledgerchat_net::GatewayConfig;
use ledgerchat_shared::constants::{
    DEFAULT_CONTENT_STORE_URL, DEFAULT_SOFT_FAILURE_THRESHOLD, DEFAULT_SYNC_INTERVAL_SECS,
    MAX_TRANSIENT_RETRIES,
};

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the IPFS-compatible HTTP API.
    /// Env: `CONTENT_STORE_URL`
    /// Default: `http://localhost:5001`
    pub content_store_url: String,

    /// Per-request timeout for the content store.
    /// Env: `CONTENT_STORE_TIMEOUT_SECS`
    /// Default: `10`
    pub content_store_timeout: Duration,

    /// Local database file.
    /// Env: `LEDGERCHAT_DB_PATH`
    /// Default: platform data directory (`None` here).
    pub db_path: Option<PathBuf>,

    /// Pause before reconnecting a tripped ledger connection.
    /// Env: `LEDGER_RESET_DELAY_MS`
    /// Default: `1000`
    pub reset_delay: Duration,

    /// Soft transport failures before the ledger circuit opens.
    /// Env: `LEDGER_SOFT_FAILURE_THRESHOLD`
    /// Default: `3`
    pub soft_failure_threshold: u32,

    /// Conversation polling interval.
    /// Env: `SYNC_INTERVAL_SECS`
    /// Default: `5`
    pub sync_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            content_store_url: DEFAULT_CONTENT_STORE_URL.to_string(),
            content_store_timeout: Duration::from_secs(10),
            db_path: None,
            reset_delay: Duration::from_millis(1000),
            soft_failure_threshold: DEFAULT_SOFT_FAILURE_THRESHOLD,
            sync_interval: Duration::from_secs(DEFAULT_SYNC_INTERVAL_SECS),
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(url) = lookup("CONTENT_STORE_URL") {
            if url.trim().is_empty() {
                tracing::warn!("Empty CONTENT_STORE_URL, using default");
            } else {
                config.content_store_url = url.trim().to_string();
            }
        }

        if let Some(secs) = parse_var::<u64>(&lookup, "CONTENT_STORE_TIMEOUT_SECS") {
            config.content_store_timeout = Duration::from_secs(secs);
        }

        if let Some(path) = lookup("LEDGERCHAT_DB_PATH") {
            if !path.is_empty() {
                config.db_path = Some(PathBuf::from(path));
            }
        }

        if let Some(ms) = parse_var::<u64>(&lookup, "LEDGER_RESET_DELAY_MS") {
            config.reset_delay = Duration::from_millis(ms);
        }

        if let Some(n) = parse_var::<u32>(&lookup, "LEDGER_SOFT_FAILURE_THRESHOLD") {
            if n == 0 {
                tracing::warn!("LEDGER_SOFT_FAILURE_THRESHOLD must be positive, using default");
            } else {
                config.soft_failure_threshold = n;
            }
        }

        if let Some(secs) = parse_var::<u64>(&lookup, "SYNC_INTERVAL_SECS") {
            if secs == 0 {
                tracing::warn!("SYNC_INTERVAL_SECS must be positive, using default");
            } else {
                config.sync_interval = Duration::from_secs(secs);
            }
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter.

        config
    }

    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            reset_delay: self.reset_delay,
            soft_failure_threshold: self.soft_failure_threshold,
            max_retries: MAX_TRANSIENT_RETRIES,
        }
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Invalid value, using default");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = ClientConfig::from_lookup(lookup(&[]));
        assert_eq!(config.content_store_url, "http://localhost:5001");
        assert_eq!(config.content_store_timeout, Duration::from_secs(10));
        assert_eq!(config.reset_delay, Duration::from_millis(1000));
        assert_eq!(config.soft_failure_threshold, 3);
        assert_eq!(config.sync_interval, Duration::from_secs(5));
        assert!(config.db_path.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = ClientConfig::from_lookup(lookup(&[
            ("CONTENT_STORE_URL", "http://ipfs.internal:5001"),
            ("CONTENT_STORE_TIMEOUT_SECS", "3"),
            ("LEDGERCHAT_DB_PATH", "/tmp/lc.db"),
            ("LEDGER_RESET_DELAY_MS", "250"),
            ("LEDGER_SOFT_FAILURE_THRESHOLD", "5"),
            ("SYNC_INTERVAL_SECS", "2"),
        ]));
        assert_eq!(config.content_store_url, "http://ipfs.internal:5001");
        assert_eq!(config.content_store_timeout, Duration::from_secs(3));
        assert_eq!(config.db_path, Some(PathBuf::from("/tmp/lc.db")));
        assert_eq!(config.gateway_config().reset_delay, Duration::from_millis(250));
        assert_eq!(config.gateway_config().soft_failure_threshold, 5);
        assert_eq!(config.sync_interval, Duration::from_secs(2));
    }

    #[test]
    fn test_invalid_values_keep_defaults() {
        let config = ClientConfig::from_lookup(lookup(&[
            ("CONTENT_STORE_TIMEOUT_SECS", "soon"),
            ("LEDGER_SOFT_FAILURE_THRESHOLD", "0"),
            ("SYNC_INTERVAL_SECS", "-1"),
        ]));
        assert_eq!(config.content_store_timeout, Duration::from_secs(10));
        assert_eq!(config.soft_failure_threshold, 3);
        assert_eq!(config.sync_interval, Duration::from_secs(5));
    }
}
