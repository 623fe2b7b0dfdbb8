use std::time::Duration;

use serde::Deserialize;

use coinledger_core::{Currency, CurrencyRegistry, LedgerError, PoolSettings, RetryPolicy};

/// Resolved configuration for the whole engine. The host reads its own
/// config file and hands the document here; the core never touches the
/// filesystem itself.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_backend")]
    pub backend: BackendConfig,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default = "default_currencies")]
    pub currencies: Vec<CurrencyConfig>,

    #[serde(default)]
    pub engine: EngineConfig,
}

/// Storage backend selection, fixed at startup.
#[derive(Debug, Deserialize, Clone)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendConfig {
    Sqlite {
        #[serde(default = "default_sqlite_path")]
        path: String,
    },
    Mysql(NetworkConfig),
    Mariadb(NetworkConfig),
}

#[derive(Debug, Deserialize, Clone)]
pub struct NetworkConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_database")]
    pub database: String,

    #[serde(default = "default_username")]
    pub username: String,

    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PoolConfig {
    #[serde(default = "default_pool_max")]
    pub max_size: usize,

    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,

    #[serde(default = "default_validate_after_ms")]
    pub validate_after_ms: u64,
}

impl PoolConfig {
    pub fn settings(&self) -> PoolSettings {
        PoolSettings {
            max_size: self.max_size,
            acquire_timeout: Duration::from_millis(self.acquire_timeout_ms),
            validate_after: Duration::from_millis(self.validate_after_ms),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: default_pool_max(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            validate_after_ms: default_validate_after_ms(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CurrencyConfig {
    pub name: String,

    #[serde(default = "default_symbol")]
    pub symbol: String,

    #[serde(default = "default_decimals")]
    pub decimals: u32,

    /// Balance granted on lazy account creation, in minor units.
    #[serde(default = "default_starting_balance")]
    pub starting_balance: i64,

    #[serde(default)]
    pub overdraft: bool,

    /// Display names; empty falls back to `name`.
    #[serde(default)]
    pub name_singular: String,

    #[serde(default)]
    pub name_plural: String,
}

impl CurrencyConfig {
    pub fn to_currency(&self) -> Currency {
        let fallback = |s: &str| {
            if s.is_empty() {
                self.name.clone()
            } else {
                s.to_string()
            }
        };
        Currency {
            name: self.name.as_str().into(),
            symbol: self.symbol.clone(),
            decimals: self.decimals,
            starting_balance: self.starting_balance,
            overdraft: self.overdraft,
            name_singular: fallback(&self.name_singular),
            name_plural: fallback(&self.name_plural),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    /// Cache entries older than this are reconciled against the backend.
    #[serde(default = "default_cache_staleness_ms")]
    pub cache_staleness_ms: u64,

    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// Transfer fee in basis points, deducted from the credited amount.
    #[serde(default)]
    pub transfer_fee_bps: u32,
}

impl EngineConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_attempts,
            Duration::from_millis(self.retry_base_delay_ms),
            Duration::from_secs(2),
        )
    }

    pub fn cache_staleness(&self) -> Duration {
        Duration::from_millis(self.cache_staleness_ms)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_staleness_ms: default_cache_staleness_ms(),
            retry_attempts: default_retry_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            transfer_fee_bps: 0,
        }
    }
}

fn default_backend() -> BackendConfig {
    BackendConfig::Sqlite { path: default_sqlite_path() }
}

fn default_sqlite_path() -> String {
    "coinledger.db".to_string()
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    coinledger_mysql::DEFAULT_PORT
}

fn default_database() -> String {
    "coinledger".to_string()
}

fn default_username() -> String {
    "root".to_string()
}

fn default_pool_max() -> usize {
    10
}

fn default_acquire_timeout_ms() -> u64 {
    30_000
}

fn default_validate_after_ms() -> u64 {
    30_000
}

fn default_symbol() -> String {
    "$".to_string()
}

fn default_decimals() -> u32 {
    2
}

fn default_starting_balance() -> i64 {
    10_000
}

fn default_cache_staleness_ms() -> u64 {
    30_000
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    50
}

fn default_currencies() -> Vec<CurrencyConfig> {
    vec![CurrencyConfig {
        name: "coins".to_string(),
        symbol: default_symbol(),
        decimals: default_decimals(),
        starting_balance: default_starting_balance(),
        overdraft: false,
        name_singular: "coin".to_string(),
        name_plural: "coins".to_string(),
    }]
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            pool: PoolConfig::default(),
            currencies: default_currencies(),
            engine: EngineConfig::default(),
        }
    }
}

impl Config {
    /// Parses a TOML document already read by the host.
    pub fn from_toml_str(raw: &str) -> Result<Self, LedgerError> {
        toml::from_str(raw)
            .map_err(|e| LedgerError::ConstraintViolation(format!("invalid configuration: {e}")))
    }

    pub fn registry(&self) -> Result<CurrencyRegistry, LedgerError> {
        CurrencyRegistry::new(self.currencies.iter().map(CurrencyConfig::to_currency).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert!(matches!(config.backend, BackendConfig::Sqlite { .. }));
        assert_eq!(config.pool.max_size, 10);
        assert_eq!(config.currencies.len(), 1);
        assert_eq!(config.engine.retry_attempts, 3);

        let registry = config.registry().unwrap();
        assert_eq!(registry.default_currency().name.as_ref(), "coins");
    }

    #[test]
    fn networked_backend_and_currencies_parse() {
        let config = Config::from_toml_str(
            r#"
            [backend]
            type = "mariadb"
            host = "db.example.net"
            database = "economy"
            username = "ledger"
            password = "hunter2"

            [pool]
            max_size = 20

            [[currencies]]
            name = "coins"

            [[currencies]]
            name = "gems"
            symbol = "*"
            decimals = 0
            starting_balance = 0
            overdraft = true

            [engine]
            transfer_fee_bps = 250
            "#,
        )
        .unwrap();

        match &config.backend {
            BackendConfig::Mariadb(net) => {
                assert_eq!(net.host, "db.example.net");
                assert_eq!(net.port, 3306);
            }
            other => panic!("expected mariadb backend, got {other:?}"),
        }
        assert_eq!(config.pool.max_size, 20);
        assert_eq!(config.engine.transfer_fee_bps, 250);

        let registry = config.registry().unwrap();
        let gems = registry.get("gems").unwrap();
        assert!(gems.overdraft);
        assert_eq!(gems.decimals, 0);
        // display names fall back to the currency name
        assert_eq!(gems.name_plural, "gems");
    }

    #[test]
    fn malformed_document_is_rejected() {
        let err = Config::from_toml_str("backend = 7").unwrap_err();
        assert!(matches!(err, LedgerError::ConstraintViolation(_)));
    }
}
