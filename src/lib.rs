//! CoinLedger — the balance ledger and transaction engine behind a
//! multiplayer game server economy.
//!
//! The host server owns scheduling, commands and events; this crate owns
//! the data: player balances per currency, the append-only transaction
//! trail, a write-through cache for display-frequency reads, and the
//! storage backends that make it durable. Everything here may be called
//! from any host worker thread at any time.
//!
//! ```no_run
//! use std::sync::Arc;
//! use coinledger::{backend_from_config, Config, TransactionEngine};
//!
//! # fn main() -> Result<(), coinledger::LedgerError> {
//! let config = Config::from_toml_str(r#"
//!     [backend]
//!     type = "sqlite"
//!     path = "economy.db"
//! "#)?;
//! let backend = backend_from_config(&config)?;
//! let registry = Arc::new(config.registry()?);
//! let engine = TransactionEngine::initialize(backend, registry, &config.engine)?;
//! let player = uuid::Uuid::new_v4();
//! engine.apply(player, "coins", 500, "server", "login bonus")?;
//! # Ok(())
//! # }
//! ```

pub mod bridge;
pub mod cache;
pub mod config;
pub mod engine;
pub mod placeholder;

use std::sync::Arc;

pub use coinledger_core::{
    Account, AccountKey, Applied, BalanceRanking, Currency, CurrencyRegistry, LedgerBackend,
    LedgerError, LedgerRecord, Mutation, PoolSettings, RetryPolicy, TxKind, SCHEMA_VERSION,
};

pub use bridge::{BridgeAdapter, BridgeOutcome, BridgeResponse, EconomyBridge};
pub use cache::BalanceCache;
pub use config::{BackendConfig, Config, CurrencyConfig, EngineConfig, NetworkConfig, PoolConfig};
pub use engine::{TransactionEngine, TransferReceipt};
pub use placeholder::PlaceholderSource;

use coinledger_mysql::{Flavor, MysqlBackend, MysqlSettings};
use coinledger_sqlite::SqliteBackend;

/// Builds the configured storage backend. The variant is fixed here, once,
/// at startup; everything above this call is backend-agnostic.
pub fn backend_from_config(config: &Config) -> Result<Arc<dyn LedgerBackend>, LedgerError> {
    let pool = config.pool.settings();
    let backend: Arc<dyn LedgerBackend> = match &config.backend {
        BackendConfig::Sqlite { path } => {
            tracing::info!(%path, "using embedded sqlite backend");
            Arc::new(SqliteBackend::open(path, pool)?)
        }
        BackendConfig::Mysql(net) => {
            Arc::new(MysqlBackend::connect(network_settings(net, Flavor::MySql), pool)?)
        }
        BackendConfig::Mariadb(net) => {
            Arc::new(MysqlBackend::connect(network_settings(net, Flavor::MariaDb), pool)?)
        }
    };
    Ok(backend)
}

fn network_settings(net: &NetworkConfig, flavor: Flavor) -> MysqlSettings {
    MysqlSettings {
        flavor,
        host: net.host.clone(),
        port: net.port,
        database: net.database.clone(),
        username: net.username.clone(),
        password: net.password.clone(),
    }
}
