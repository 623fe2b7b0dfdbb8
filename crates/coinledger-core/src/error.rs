use thiserror::Error;

/// Error taxonomy shared by the engine and every storage backend.
///
/// Variants split into transient conditions the engine retries locally
/// (`BackendUnavailable`, `PoolExhausted`), terminal rejections returned to
/// the caller (`ConstraintViolation`, `InsufficientFunds`, ...), and the
/// startup-fatal `IncompatibleSchemaVersion`.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("connection pool exhausted after {waited_ms}ms")]
    PoolExhausted { waited_ms: u64 },

    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: i64, available: i64 },

    #[error("incompatible schema version: database has {found}, this build supports up to {supported}")]
    IncompatibleSchemaVersion { found: i64, supported: i64 },

    #[error("account not found: {0}")]
    AccountNotFound(String),

    #[error("unknown currency: {0}")]
    UnknownCurrency(String),

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    /// Optimistic-concurrency miss: the account row moved under us.
    /// Storage-contract internal; the engine reloads and retries, callers
    /// never see this variant.
    #[error("account version is stale")]
    StaleVersion,

    #[error("operation failed after retries: {0}")]
    OperationFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl LedgerError {
    /// Whether the retry policy may re-attempt the operation.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LedgerError::BackendUnavailable(_)
                | LedgerError::PoolExhausted { .. }
                | LedgerError::Io(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(LedgerError::BackendUnavailable("refused".into()).is_transient());
        assert!(LedgerError::PoolExhausted { waited_ms: 30_000 }.is_transient());
        assert!(!LedgerError::InsufficientFunds { required: 10, available: 5 }.is_transient());
        assert!(!LedgerError::ConstraintViolation("negative balance".into()).is_transient());
        assert!(!LedgerError::StaleVersion.is_transient());
    }
}
