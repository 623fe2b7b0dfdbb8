pub mod currency;
pub mod error;
pub mod models;
pub mod pool;
pub mod retry;
pub mod storage;

pub use currency::{Currency, CurrencyRegistry};
pub use error::LedgerError;
pub use models::{
    Account, AccountKey, Applied, BalanceRanking, LedgerRecord, Mutation, TxKind,
};
pub use pool::{ConnectionManager, Pool, PoolSettings, PooledConn};
pub use retry::RetryPolicy;
pub use storage::{LedgerBackend, SCHEMA_VERSION};
