use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use uuid::Uuid;

use coinledger_core::{
    AccountKey, Applied, BalanceRanking, Currency, CurrencyRegistry, LedgerBackend, LedgerError,
    LedgerRecord, Mutation, RetryPolicy, TxKind,
};

use crate::cache::BalanceCache;
use crate::config::EngineConfig;

/// How many times a mutation is recomputed after the account version moved
/// under an external writer sharing the database.
const MAX_STALE_RELOADS: u32 = 3;

/// Summary of a completed transfer.
#[derive(Debug, Clone, Copy)]
pub struct TransferReceipt {
    pub amount: i64,
    pub fee: i64,
    pub from_balance: i64,
    pub to_balance: i64,
}

/// Applies balance-changing operations with three guarantees: atomicity
/// (cache and backend either both reflect a change or neither does),
/// per-account serialization (a mutex per account key; unrelated accounts
/// proceed in parallel), and per-account sequencing (every committed change
/// carries the next sequence value).
///
/// The engine does not deduplicate repeated calls with identical arguments;
/// callers needing exactly-once semantics embed an idempotency key in
/// `reason`.
pub struct TransactionEngine {
    backend: Arc<dyn LedgerBackend>,
    cache: BalanceCache,
    currencies: Arc<CurrencyRegistry>,
    locks: DashMap<AccountKey, Arc<Mutex<()>>>,
    retry: RetryPolicy,
    transfer_fee_bps: u32,
}

impl TransactionEngine {
    /// Runs schema creation/migration before anything else; a database
    /// written by a newer build refuses to start here rather than risk
    /// silent corruption.
    pub fn initialize(
        backend: Arc<dyn LedgerBackend>,
        currencies: Arc<CurrencyRegistry>,
        config: &EngineConfig,
    ) -> Result<Self, LedgerError> {
        backend.ensure_schema()?;
        tracing::info!(schema_version = backend.schema_version()?, "transaction engine ready");
        Ok(Self {
            backend,
            cache: BalanceCache::new(config.cache_staleness()),
            currencies,
            locks: DashMap::new(),
            retry: config.retry_policy(),
            transfer_fee_bps: config.transfer_fee_bps,
        })
    }

    pub fn currencies(&self) -> &Arc<CurrencyRegistry> {
        &self.currencies
    }

    /// Read-only cache handle for surfaces that must never block on the
    /// backend (placeholders).
    pub fn cache(&self) -> &BalanceCache {
        &self.cache
    }

    /// Flush/teardown at shutdown. Writes are through, so dropping the
    /// cache loses nothing; the pools close with the backend.
    pub fn shutdown(&self) {
        self.cache.clear();
        tracing::info!("transaction engine shut down");
    }

    fn lock_for(&self, key: &AccountKey) -> Arc<Mutex<()>> {
        self.locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn account_key(
        &self,
        player: Uuid,
        currency: &str,
    ) -> Result<(AccountKey, Arc<Currency>), LedgerError> {
        let currency = self.currencies.get(currency)?.clone();
        Ok((AccountKey::new(player, currency.name.clone()), currency))
    }

    /// Current row state, cache first, with lazy creation on first
    /// reference. Callers on the mutation path hold the account lock.
    fn current_state(
        &self,
        key: &AccountKey,
        currency: &Currency,
    ) -> Result<Applied, LedgerError> {
        if let Some(cached) = self.cache.get(key) {
            return Ok(Applied {
                balance: cached.balance,
                sequence: cached.sequence,
                version: cached.version,
            });
        }
        let account = match self.retry.run(|| self.backend.load_account(key))? {
            Some(account) => account,
            None => self
                .retry
                .run(|| self.backend.create_account(key, currency.starting_balance))?,
        };
        self.cache.store(key, account.balance, account.sequence, account.version);
        Ok(Applied {
            balance: account.balance,
            sequence: account.sequence,
            version: account.version,
        })
    }

    /// Applies a signed delta in minor units and returns the new balance.
    /// `InsufficientFunds` when the result would go negative and the
    /// currency disallows overdraft; no state changes on any rejection.
    pub fn apply(
        &self,
        player: Uuid,
        currency: &str,
        delta: i64,
        actor: &str,
        reason: &str,
    ) -> Result<i64, LedgerError> {
        if delta == 0 {
            return Err(LedgerError::InvalidAmount("delta must be non-zero".to_string()));
        }
        let kind = if delta > 0 { TxKind::Deposit } else { TxKind::Withdraw };
        let (key, currency) = self.account_key(player, currency)?;
        let lock = self.lock_for(&key);
        let _guard = lock.lock().unwrap();
        let applied = self.mutate_locked(&key, &currency, kind, actor, reason, |balance| {
            candidate(balance, delta, &currency).map(|new_balance| (new_balance, delta))
        })?;
        Ok(applied.balance)
    }

    /// Administrative absolute set. Recorded in the ledger like any other
    /// mutation, so the audit trail covers admin grants and wipe-resets.
    pub fn set_balance(
        &self,
        player: Uuid,
        currency: &str,
        amount: i64,
        actor: &str,
        reason: &str,
    ) -> Result<i64, LedgerError> {
        let (key, currency) = self.account_key(player, currency)?;
        if amount < 0 && !currency.overdraft {
            return Err(LedgerError::InvalidAmount(
                "negative balance not allowed for this currency".to_string(),
            ));
        }
        let lock = self.lock_for(&key);
        let _guard = lock.lock().unwrap();
        let applied =
            self.mutate_locked(&key, &currency, TxKind::AdminSet, actor, reason, |balance| {
                Ok((amount, amount - balance))
            })?;
        Ok(applied.balance)
    }

    fn mutate_locked(
        &self,
        key: &AccountKey,
        currency: &Currency,
        kind: TxKind,
        actor: &str,
        reason: &str,
        compute: impl Fn(i64) -> Result<(i64, i64), LedgerError>,
    ) -> Result<Applied, LedgerError> {
        for _ in 0..MAX_STALE_RELOADS {
            let current = self.current_state(key, currency)?;
            let (new_balance, delta) = compute(current.balance)?;
            let mutation = Mutation {
                key: key.clone(),
                expected_version: current.version,
                new_balance,
                kind,
                delta,
                actor: Arc::from(actor),
                reason: Arc::from(reason),
            };
            match self.retry.run(|| self.backend.apply_mutation(&mutation)) {
                Ok(applied) => {
                    self.cache.store(key, applied.balance, applied.sequence, applied.version);
                    tracing::debug!(account = %key, delta, balance = applied.balance,
                        sequence = applied.sequence, kind = kind.as_str(), "applied mutation");
                    return Ok(applied);
                }
                Err(LedgerError::StaleVersion) => {
                    tracing::debug!(account = %key, "row version moved externally, reloading");
                    self.cache.invalidate(key);
                }
                Err(e) => return Err(e),
            }
        }
        Err(LedgerError::OperationFailed(
            "account version kept changing under external writes".to_string(),
        ))
    }

    /// Same-currency transfer. Both account locks are taken in the fixed
    /// global key order, so two opposite-direction transfers can never
    /// deadlock; both legs commit in a single backend transaction.
    pub fn transfer(
        &self,
        from: Uuid,
        to: Uuid,
        currency: &str,
        amount: i64,
        actor: &str,
        reason: &str,
    ) -> Result<TransferReceipt, LedgerError> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount(
                "transfer amount must be positive".to_string(),
            ));
        }
        if from == to {
            return Err(LedgerError::InvalidAmount(
                "cannot transfer to the sending account".to_string(),
            ));
        }
        let (from_key, currency) = self.account_key(from, currency)?;
        let to_key = AccountKey::new(to, currency.name.clone());
        let fee = transfer_fee(amount, self.transfer_fee_bps);
        let credited = amount - fee;

        let (first, second) = if from_key <= to_key {
            (&from_key, &to_key)
        } else {
            (&to_key, &from_key)
        };
        let first_lock = self.lock_for(first);
        let second_lock = self.lock_for(second);
        let _first_guard = first_lock.lock().unwrap();
        let _second_guard = second_lock.lock().unwrap();

        for _ in 0..MAX_STALE_RELOADS {
            let from_state = self.current_state(&from_key, &currency)?;
            let to_state = self.current_state(&to_key, &currency)?;
            let from_balance = candidate(from_state.balance, -amount, &currency)?;
            let to_balance = candidate(to_state.balance, credited, &currency)?;
            let debit = Mutation {
                key: from_key.clone(),
                expected_version: from_state.version,
                new_balance: from_balance,
                kind: TxKind::TransferOut,
                delta: -amount,
                actor: Arc::from(actor),
                reason: Arc::from(reason),
            };
            let credit = Mutation {
                key: to_key.clone(),
                expected_version: to_state.version,
                new_balance: to_balance,
                kind: TxKind::TransferIn,
                delta: credited,
                actor: Arc::from(actor),
                reason: Arc::from(reason),
            };
            match self.retry.run(|| self.backend.apply_transfer(&debit, &credit)) {
                Ok((debit_applied, credit_applied)) => {
                    self.cache.store(
                        &from_key,
                        debit_applied.balance,
                        debit_applied.sequence,
                        debit_applied.version,
                    );
                    self.cache.store(
                        &to_key,
                        credit_applied.balance,
                        credit_applied.sequence,
                        credit_applied.version,
                    );
                    tracing::debug!(from = %from_key, to = %to_key, amount, fee, "transfer committed");
                    return Ok(TransferReceipt {
                        amount,
                        fee,
                        from_balance: debit_applied.balance,
                        to_balance: credit_applied.balance,
                    });
                }
                Err(LedgerError::StaleVersion) => {
                    self.cache.invalidate(&from_key);
                    self.cache.invalidate(&to_key);
                }
                Err(e) => return Err(e),
            }
        }
        Err(LedgerError::OperationFailed(
            "account versions kept changing under external writes".to_string(),
        ))
    }

    /// Cache-first read; falls through to the backend on a miss and creates
    /// the account lazily.
    pub fn balance(&self, player: Uuid, currency: &str) -> Result<i64, LedgerError> {
        let (key, currency) = self.account_key(player, currency)?;
        if let Some(cached) = self.cache.get(&key) {
            return Ok(cached.balance);
        }
        let lock = self.lock_for(&key);
        let _guard = lock.lock().unwrap();
        Ok(self.current_state(&key, &currency)?.balance)
    }

    pub fn has(&self, player: Uuid, currency: &str, amount: i64) -> Result<bool, LedgerError> {
        Ok(self.balance(player, currency)? >= amount)
    }

    /// Existence check without lazy creation.
    pub fn has_account(&self, player: Uuid, currency: &str) -> Result<bool, LedgerError> {
        let (key, _) = self.account_key(player, currency)?;
        if self.cache.peek(&key).is_some() {
            return Ok(true);
        }
        Ok(self.retry.run(|| self.backend.load_account(&key))?.is_some())
    }

    /// Most-recent-first ledger trail.
    pub fn history(
        &self,
        player: Uuid,
        currency: &str,
        limit: usize,
    ) -> Result<Vec<LedgerRecord>, LedgerError> {
        let (key, _) = self.account_key(player, currency)?;
        self.retry.run(|| self.backend.history(&key, limit))
    }

    /// Administrative removal of the account row and its ledger records.
    /// The next reference recreates the account at the starting balance.
    pub fn wipe_account(&self, player: Uuid, currency: &str) -> Result<(), LedgerError> {
        let (key, _) = self.account_key(player, currency)?;
        let lock = self.lock_for(&key);
        let _guard = lock.lock().unwrap();
        self.retry.run(|| self.backend.wipe_account(&key))?;
        self.cache.invalidate(&key);
        Ok(())
    }

    pub fn top_balances(
        &self,
        currency: &str,
        limit: usize,
    ) -> Result<Vec<BalanceRanking>, LedgerError> {
        let currency = self.currencies.get(currency)?.clone();
        self.retry.run(|| self.backend.top_balances(&currency.name, limit))
    }

    /// Money in circulation for one currency.
    pub fn total_balance(&self, currency: &str) -> Result<i64, LedgerError> {
        let currency = self.currencies.get(currency)?.clone();
        self.retry.run(|| self.backend.total_balance(&currency.name))
    }

    pub fn format(&self, currency: &str, amount: i64) -> Result<String, LedgerError> {
        Ok(self.currencies.get(currency)?.format(amount))
    }
}

fn candidate(balance: i64, delta: i64, currency: &Currency) -> Result<i64, LedgerError> {
    let next = balance
        .checked_add(delta)
        .ok_or_else(|| LedgerError::InvalidAmount("balance overflow".to_string()))?;
    if next < 0 && !currency.overdraft {
        return Err(LedgerError::InsufficientFunds { required: -delta, available: balance });
    }
    Ok(next)
}

fn transfer_fee(amount: i64, fee_bps: u32) -> i64 {
    ((amount as i128 * fee_bps as i128) / 10_000) as i64
}
