//! Worker configuration
//!
//! Everything is read from `FERRY_*` environment variables (a `.env` file is
//! honored) with the defaults below.

use serde::{Deserialize, Serialize};

use crate::migration::ChainPolicy;

// ============================================================================
// Defaults
// ============================================================================

/// Default timeout for outbound HTTP requests in seconds.
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

/// Default number of extra delivery attempts per batch.
pub const DEFAULT_DELIVERY_RETRIES: u32 = 0;

/// Default pause between delivery attempts in milliseconds.
pub const DEFAULT_DELIVERY_BACKOFF_MS: u64 = 500;

/// Default maximum connections in a source database pool.
pub const DEFAULT_DB_MAX_CONNECTIONS: u32 = 2;

/// Default source database connection timeout in seconds.
pub const DEFAULT_DB_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default scroll context lifetime for search imports.
pub const DEFAULT_SCROLL_KEEPALIVE: &str = "5m";

/// Worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub http: HttpConfig,
    pub delivery: DeliveryConfig,
    pub database: DatabaseConfig,
    pub search: SearchConfig,
    pub chain_policy: ChainPolicy,
}

/// Outbound HTTP client settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    pub timeout_secs: u64,
}

/// Batch delivery settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    pub retries: u32,
    pub backoff_ms: u64,
}

/// Source database pool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub max_connections: u32,
    pub connect_timeout_secs: u64,
}

/// Search import settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    pub scroll_keepalive: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            http: HttpConfig {
                timeout_secs: DEFAULT_HTTP_TIMEOUT_SECS,
            },
            delivery: DeliveryConfig {
                retries: DEFAULT_DELIVERY_RETRIES,
                backoff_ms: DEFAULT_DELIVERY_BACKOFF_MS,
            },
            database: DatabaseConfig {
                max_connections: DEFAULT_DB_MAX_CONNECTIONS,
                connect_timeout_secs: DEFAULT_DB_CONNECT_TIMEOUT_SECS,
            },
            search: SearchConfig {
                scroll_keepalive: DEFAULT_SCROLL_KEEPALIVE.to_string(),
            },
            chain_policy: ChainPolicy::default(),
        }
    }
}

impl WorkerConfig {
    /// Load configuration from environment and defaults
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let chain_policy = match lookup("FERRY_CHAIN_POLICY") {
            Some(raw) => raw
                .parse()
                .map_err(|e| anyhow::anyhow!("FERRY_CHAIN_POLICY: {}", e))?,
            None => defaults.chain_policy,
        };

        let config = Self {
            http: HttpConfig {
                timeout_secs: parsed(&lookup, "FERRY_HTTP_TIMEOUT_SECS")
                    .unwrap_or(defaults.http.timeout_secs),
            },
            delivery: DeliveryConfig {
                retries: parsed(&lookup, "FERRY_DELIVERY_RETRIES").unwrap_or(defaults.delivery.retries),
                backoff_ms: parsed(&lookup, "FERRY_DELIVERY_BACKOFF_MS")
                    .unwrap_or(defaults.delivery.backoff_ms),
            },
            database: DatabaseConfig {
                max_connections: parsed(&lookup, "FERRY_DB_MAX_CONNECTIONS")
                    .unwrap_or(defaults.database.max_connections),
                connect_timeout_secs: parsed(&lookup, "FERRY_DB_CONNECT_TIMEOUT_SECS")
                    .unwrap_or(defaults.database.connect_timeout_secs),
            },
            search: SearchConfig {
                scroll_keepalive: lookup("FERRY_SCROLL_KEEPALIVE")
                    .unwrap_or(defaults.search.scroll_keepalive),
            },
            chain_policy,
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.http.timeout_secs == 0 {
            anyhow::bail!("HTTP timeout must be greater than 0");
        }

        if self.database.max_connections == 0 {
            anyhow::bail!("Database max_connections must be greater than 0");
        }

        if self.search.scroll_keepalive.trim().is_empty() {
            anyhow::bail!("Scroll keepalive cannot be empty");
        }

        Ok(())
    }
}

fn parsed<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    lookup(key).and_then(|s| s.trim().parse().ok())
}
