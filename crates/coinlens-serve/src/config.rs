//! Service configuration.
//!
//! Environment-driven with defaults; the RPC credential pair is shared by
//! every coin's gateway.

use std::time::Duration;

use coinlens_core::error::ConfigError;

/// Default keyspace holding the `available_coins` configuration table.
const DEFAULT_COINS_KEYSPACE: &str = "coins";

/// Default delay between reconciliation polls, measured from poll completion.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Configuration for the coin service.
#[derive(Debug, Clone)]
pub struct ServeConfig {
    /// Keyspace containing the coin-configuration table.
    pub coins_keyspace: String,
    /// Delay between reconciliation polls (from poll completion).
    pub poll_interval: Duration,
    /// RPC username used for every coin's gateway.
    pub rpc_username: String,
    /// RPC password used for every coin's gateway.
    pub rpc_password: String,
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            coins_keyspace: DEFAULT_COINS_KEYSPACE.to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            rpc_username: String::new(),
            rpc_password: String::new(),
        }
    }
}

impl ServeConfig {
    /// Load configuration from the environment, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Ok(keyspace) = std::env::var("COINS_KEYSPACE") {
            config.coins_keyspace = keyspace;
        }
        if let Ok(raw) = std::env::var("COIN_POLL_INTERVAL_MS") {
            config.poll_interval = parse_interval_ms(&raw)?;
        }
        if let Ok(username) = std::env::var("BLOCKCHAIN_RPC_USERNAME") {
            config.rpc_username = username;
        }
        if let Ok(password) = std::env::var("BLOCKCHAIN_RPC_PASSWORD") {
            config.rpc_password = password;
        }
        Ok(config)
    }
}

fn parse_interval_ms(raw: &str) -> Result<Duration, ConfigError> {
    let ms: u64 = raw.parse().map_err(|_| ConfigError::Invalid {
        var: "COIN_POLL_INTERVAL_MS",
        reason: format!("'{raw}' is not a millisecond count"),
    })?;
    Ok(Duration::from_millis(ms))
}
