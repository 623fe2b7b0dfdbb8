use crate::error::LedgerError;
use crate::models::{Account, AccountKey, Applied, BalanceRanking, LedgerRecord, Mutation};

/// Newest schema these crates understand. Backends apply forward-only
/// migrations up to this version and refuse to serve a database whose
/// recorded version is newer.
pub const SCHEMA_VERSION: i64 = 2;

/// Uniform contract implemented by every storage backend. Dialect
/// differences (upsert syntax, autoincrement, table options) stay inside
/// the implementations; callers never branch on backend kind.
///
/// Connectivity failures surface as `BackendUnavailable` (retryable);
/// schema-level rejections surface as `ConstraintViolation` (terminal).
pub trait LedgerBackend: Send + Sync {
    /// Idempotent schema creation/migration. Must run before any other
    /// operation; fails with `IncompatibleSchemaVersion` rather than touch
    /// a database from a newer build.
    fn ensure_schema(&self) -> Result<(), LedgerError>;

    /// Version currently recorded in the database, 0 when untouched.
    fn schema_version(&self) -> Result<i64, LedgerError>;

    /// Reads one account row; `Ok(None)` when the row does not exist.
    fn load_account(&self, key: &AccountKey) -> Result<Option<Account>, LedgerError>;

    /// Insert-if-absent, then return the row. Safe to call concurrently for
    /// the same key; exactly one row wins.
    fn create_account(&self, key: &AccountKey, starting_balance: i64)
        -> Result<Account, LedgerError>;

    /// Writes `new_balance` guarded by `expected_version`, bumps
    /// sequence/version and appends the ledger record, all inside one
    /// backend transaction. `StaleVersion` when the guard misses.
    fn apply_mutation(&self, mutation: &Mutation) -> Result<Applied, LedgerError>;

    /// Both transfer legs and both ledger records in a single backend
    /// transaction; a crash between the legs is impossible.
    fn apply_transfer(
        &self,
        debit: &Mutation,
        credit: &Mutation,
    ) -> Result<(Applied, Applied), LedgerError>;

    /// Most-recent-first ledger records for one account.
    fn history(&self, key: &AccountKey, limit: usize) -> Result<Vec<LedgerRecord>, LedgerError>;

    /// Administrative removal of the row and its records.
    /// `AccountNotFound` when nothing existed.
    fn wipe_account(&self, key: &AccountKey) -> Result<(), LedgerError>;

    /// Highest balances in one currency, for leaderboards.
    fn top_balances(&self, currency: &str, limit: usize)
        -> Result<Vec<BalanceRanking>, LedgerError>;

    /// Sum of all balances in one currency (money in circulation).
    fn total_balance(&self, currency: &str) -> Result<i64, LedgerError>;
}
