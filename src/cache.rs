use std::time::{Duration, Instant};

use dashmap::DashMap;

use coinledger_core::AccountKey;

/// One cached row. `version` is the backend's optimistic-concurrency token
/// at load time; a conditional write against it detects external changes.
#[derive(Debug, Clone, Copy)]
pub struct CachedBalance {
    pub balance: i64,
    pub sequence: u64,
    pub version: u64,
    loaded_at: Instant,
}

/// Write-through balance cache. Every successful apply stores the new row
/// state before returning, so reads from this process never see the
/// pre-mutation balance. Synchronization is per key; unrelated accounts
/// never contend.
pub struct BalanceCache {
    entries: DashMap<AccountKey, CachedBalance>,
    staleness: Duration,
}

impl BalanceCache {
    pub fn new(staleness: Duration) -> Self {
        Self { entries: DashMap::new(), staleness }
    }

    /// Fresh entries only. Entries past the staleness window are dropped so
    /// the caller reconciles against the backend (which always wins).
    pub fn get(&self, key: &AccountKey) -> Option<CachedBalance> {
        let entry = self.entries.get(key)?;
        if entry.loaded_at.elapsed() > self.staleness {
            drop(entry);
            self.entries.remove(key);
            return None;
        }
        Some(*entry)
    }

    /// Any-age read for surfaces that must never reach the backend.
    pub fn peek(&self, key: &AccountKey) -> Option<CachedBalance> {
        self.entries.get(key).map(|entry| *entry)
    }

    pub fn store(&self, key: &AccountKey, balance: i64, sequence: u64, version: u64) {
        self.entries.insert(
            key.clone(),
            CachedBalance { balance, sequence, version, loaded_at: Instant::now() },
        );
    }

    pub fn invalidate(&self, key: &AccountKey) {
        self.entries.remove(key);
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use uuid::Uuid;

    fn key() -> AccountKey {
        AccountKey::new(Uuid::from_u128(1), Arc::from("coins"))
    }

    #[test]
    fn write_through_overwrites() {
        let cache = BalanceCache::new(Duration::from_secs(60));
        cache.store(&key(), 100, 1, 1);
        cache.store(&key(), 250, 2, 2);
        let cached = cache.get(&key()).unwrap();
        assert_eq!(cached.balance, 250);
        assert_eq!(cached.sequence, 2);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn stale_entries_fall_through_but_peek_survives() {
        let cache = BalanceCache::new(Duration::ZERO);
        cache.store(&key(), 100, 1, 1);
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(cache.peek(&key()).unwrap().balance, 100);
        assert!(cache.get(&key()).is_none());
        // the stale entry was discarded on read
        assert!(cache.peek(&key()).is_none());
    }

    #[test]
    fn invalidate_and_clear() {
        let cache = BalanceCache::new(Duration::from_secs(60));
        cache.store(&key(), 100, 1, 1);
        cache.invalidate(&key());
        assert!(cache.get(&key()).is_none());

        cache.store(&key(), 100, 1, 1);
        cache.clear();
        assert!(cache.is_empty());
    }
}
