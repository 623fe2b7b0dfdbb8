//! In-memory [`LedgerBackend`] with the same semantics as the SQL backends.
//!
//! Used by unit tests, benches and local development. Supports injecting a
//! connectivity failure between the two legs of a transfer so atomicity can
//! be exercised without a real database.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use time::OffsetDateTime;

use coinledger_core::{
    Account, AccountKey, Applied, BalanceRanking, LedgerBackend, LedgerError, LedgerRecord,
    Mutation, SCHEMA_VERSION,
};

#[derive(Default)]
struct MemState {
    accounts: HashMap<AccountKey, Account>,
    records: HashMap<AccountKey, Vec<LedgerRecord>>,
    schema_version: i64,
}

pub struct MemoryBackend {
    state: Mutex<MemState>,
    fail_next_transfer: AtomicBool,
    ops: AtomicU64,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemState::default()),
            fail_next_transfer: AtomicBool::new(false),
            ops: AtomicU64::new(0),
        }
    }

    /// Makes the next `apply_transfer` fail with `BackendUnavailable` after
    /// the debit leg has been computed but before anything is committed.
    pub fn fail_next_transfer(&self) {
        self.fail_next_transfer.store(true, Ordering::SeqCst);
    }

    /// Number of backend operations served so far. Lets tests assert that a
    /// code path (e.g. the placeholder surface) never reached the backend.
    pub fn op_count(&self) -> u64 {
        self.ops.load(Ordering::SeqCst)
    }

    fn count(&self) {
        self.ops.fetch_add(1, Ordering::SeqCst);
    }

    fn stage(
        state: &MemState,
        mutation: &Mutation,
        now: OffsetDateTime,
    ) -> Result<(Account, LedgerRecord), LedgerError> {
        let account = state
            .accounts
            .get(&mutation.key)
            .ok_or_else(|| LedgerError::AccountNotFound(mutation.key.to_string()))?;
        if account.version != mutation.expected_version {
            return Err(LedgerError::StaleVersion);
        }
        let mut next = account.clone();
        next.balance = mutation.new_balance;
        next.sequence += 1;
        next.version += 1;
        next.updated_at = now;
        let record = LedgerRecord {
            sequence: next.sequence,
            kind: mutation.kind,
            delta: mutation.delta,
            resulting_balance: mutation.new_balance,
            timestamp: now,
            actor: mutation.actor.clone(),
            reason: mutation.reason.clone(),
        };
        Ok((next, record))
    }

    fn commit(state: &mut MemState, account: Account, record: LedgerRecord) -> Applied {
        let applied = Applied {
            balance: account.balance,
            sequence: account.sequence,
            version: account.version,
        };
        let key = account.key.clone();
        state.accounts.insert(key.clone(), account);
        state.records.entry(key).or_default().push(record);
        applied
    }
}

impl LedgerBackend for MemoryBackend {
    fn ensure_schema(&self) -> Result<(), LedgerError> {
        self.count();
        let mut state = self.state.lock().unwrap();
        if state.schema_version > SCHEMA_VERSION {
            return Err(LedgerError::IncompatibleSchemaVersion {
                found: state.schema_version,
                supported: SCHEMA_VERSION,
            });
        }
        state.schema_version = SCHEMA_VERSION;
        Ok(())
    }

    fn schema_version(&self) -> Result<i64, LedgerError> {
        Ok(self.state.lock().unwrap().schema_version)
    }

    fn load_account(&self, key: &AccountKey) -> Result<Option<Account>, LedgerError> {
        self.count();
        Ok(self.state.lock().unwrap().accounts.get(key).cloned())
    }

    fn create_account(
        &self,
        key: &AccountKey,
        starting_balance: i64,
    ) -> Result<Account, LedgerError> {
        self.count();
        let mut state = self.state.lock().unwrap();
        let now = OffsetDateTime::now_utc();
        let account = state.accounts.entry(key.clone()).or_insert_with(|| {
            tracing::debug!(account = %key, starting_balance, "creating account");
            Account {
                key: key.clone(),
                balance: starting_balance,
                sequence: 0,
                version: 0,
                created_at: now,
                updated_at: now,
            }
        });
        Ok(account.clone())
    }

    fn apply_mutation(&self, mutation: &Mutation) -> Result<Applied, LedgerError> {
        self.count();
        let mut state = self.state.lock().unwrap();
        let now = OffsetDateTime::now_utc();
        let (account, record) = Self::stage(&state, mutation, now)?;
        Ok(Self::commit(&mut state, account, record))
    }

    fn apply_transfer(
        &self,
        debit: &Mutation,
        credit: &Mutation,
    ) -> Result<(Applied, Applied), LedgerError> {
        self.count();
        let mut state = self.state.lock().unwrap();
        let now = OffsetDateTime::now_utc();
        let (debit_account, debit_record) = Self::stage(&state, debit, now)?;
        if self.fail_next_transfer.swap(false, Ordering::SeqCst) {
            return Err(LedgerError::BackendUnavailable(
                "injected failure between transfer legs".to_string(),
            ));
        }
        let (credit_account, credit_record) = Self::stage(&state, credit, now)?;
        let debit_applied = Self::commit(&mut state, debit_account, debit_record);
        let credit_applied = Self::commit(&mut state, credit_account, credit_record);
        Ok((debit_applied, credit_applied))
    }

    fn history(&self, key: &AccountKey, limit: usize) -> Result<Vec<LedgerRecord>, LedgerError> {
        self.count();
        let state = self.state.lock().unwrap();
        let records = state
            .records
            .get(key)
            .map(|records| records.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default();
        Ok(records)
    }

    fn wipe_account(&self, key: &AccountKey) -> Result<(), LedgerError> {
        self.count();
        let mut state = self.state.lock().unwrap();
        if state.accounts.remove(key).is_none() {
            return Err(LedgerError::AccountNotFound(key.to_string()));
        }
        state.records.remove(key);
        Ok(())
    }

    fn top_balances(
        &self,
        currency: &str,
        limit: usize,
    ) -> Result<Vec<BalanceRanking>, LedgerError> {
        self.count();
        let state = self.state.lock().unwrap();
        let mut rankings: Vec<BalanceRanking> = state
            .accounts
            .values()
            .filter(|account| account.key.currency.as_ref() == currency)
            .map(|account| BalanceRanking {
                player: account.key.player,
                balance: account.balance,
            })
            .collect();
        rankings.sort_by(|a, b| b.balance.cmp(&a.balance));
        rankings.truncate(limit);
        Ok(rankings)
    }

    fn total_balance(&self, currency: &str) -> Result<i64, LedgerError> {
        self.count();
        let state = self.state.lock().unwrap();
        Ok(state
            .accounts
            .values()
            .filter(|account| account.key.currency.as_ref() == currency)
            .map(|account| account.balance)
            .sum())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use uuid::Uuid;

    fn key(n: u128) -> AccountKey {
        AccountKey::new(Uuid::from_u128(n), Arc::from("coins"))
    }

    fn mutation(key: &AccountKey, expected_version: u64, new_balance: i64, delta: i64) -> Mutation {
        Mutation {
            key: key.clone(),
            expected_version,
            new_balance,
            kind: if delta >= 0 { coinledger_core::TxKind::Deposit } else { coinledger_core::TxKind::Withdraw },
            delta,
            actor: Arc::from("test"),
            reason: Arc::from("unit"),
        }
    }

    #[test]
    fn create_is_idempotent() {
        let backend = MemoryBackend::new();
        let k = key(1);
        let first = backend.create_account(&k, 500).unwrap();
        let second = backend.create_account(&k, 9_999).unwrap();
        assert_eq!(first.balance, 500);
        assert_eq!(second.balance, 500);
    }

    #[test]
    fn mutation_bumps_sequence_and_version() {
        let backend = MemoryBackend::new();
        let k = key(1);
        backend.create_account(&k, 0).unwrap();
        let applied = backend.apply_mutation(&mutation(&k, 0, 100, 100)).unwrap();
        assert_eq!(applied.balance, 100);
        assert_eq!(applied.sequence, 1);
        assert_eq!(applied.version, 1);

        let err = backend.apply_mutation(&mutation(&k, 0, 200, 100)).unwrap_err();
        assert!(matches!(err, LedgerError::StaleVersion));
    }

    #[test]
    fn injected_transfer_failure_commits_nothing() {
        let backend = MemoryBackend::new();
        let a = key(1);
        let b = key(2);
        backend.create_account(&a, 1_000).unwrap();
        backend.create_account(&b, 0).unwrap();
        backend.fail_next_transfer();

        let debit = Mutation {
            kind: coinledger_core::TxKind::TransferOut,
            ..mutation(&a, 0, 700, -300)
        };
        let credit = Mutation {
            kind: coinledger_core::TxKind::TransferIn,
            ..mutation(&b, 0, 300, 300)
        };
        let err = backend.apply_transfer(&debit, &credit).unwrap_err();
        assert!(matches!(err, LedgerError::BackendUnavailable(_)));

        assert_eq!(backend.load_account(&a).unwrap().unwrap().balance, 1_000);
        assert_eq!(backend.load_account(&b).unwrap().unwrap().balance, 0);
        assert!(backend.history(&a, 10).unwrap().is_empty());

        // flag is one-shot, the next transfer goes through
        assert!(backend.apply_transfer(&debit, &credit).is_ok());
    }

    #[test]
    fn wipe_removes_row_and_trail() {
        let backend = MemoryBackend::new();
        let k = key(7);
        backend.create_account(&k, 0).unwrap();
        backend.apply_mutation(&mutation(&k, 0, 50, 50)).unwrap();
        backend.wipe_account(&k).unwrap();
        assert!(backend.load_account(&k).unwrap().is_none());
        assert!(backend.history(&k, 10).unwrap().is_empty());
        assert!(matches!(
            backend.wipe_account(&k).unwrap_err(),
            LedgerError::AccountNotFound(_)
        ));
    }

    #[test]
    fn top_balances_sorts_descending_per_currency() {
        let backend = MemoryBackend::new();
        for (n, balance) in [(1u128, 10i64), (2, 30), (3, 20)] {
            let k = key(n);
            backend.create_account(&k, 0).unwrap();
            backend.apply_mutation(&mutation(&k, 0, balance, balance)).unwrap();
        }
        let gems = AccountKey::new(Uuid::from_u128(9), Arc::from("gems"));
        backend.create_account(&gems, 99).unwrap();

        let top = backend.top_balances("coins", 2).unwrap();
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].balance, 30);
        assert_eq!(top[1].balance, 20);
        assert_eq!(backend.total_balance("coins").unwrap(), 60);
        assert_eq!(backend.total_balance("gems").unwrap(), 99);
    }
}
