use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

/// Identity of one ledger row: a player plus a currency namespace.
///
/// Ordering is derived so that callers taking several account locks can do
/// so in one fixed global order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AccountKey {
    pub player: Uuid,
    pub currency: Arc<str>,
}

impl AccountKey {
    pub fn new(player: Uuid, currency: Arc<str>) -> Self {
        Self { player, currency }
    }
}

impl std::fmt::Display for AccountKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.player, self.currency)
    }
}

/// One authoritative balance row. `balance` is in minor units; `sequence`
/// counts mutations on this account; `version` is the optimistic-concurrency
/// token checked by conditional writes.
#[derive(Debug, Clone)]
pub struct Account {
    pub key: AccountKey,
    pub balance: i64,
    pub sequence: u64,
    pub version: u64,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TxKind {
    Deposit,
    Withdraw,
    TransferOut,
    TransferIn,
    AdminSet,
}

impl TxKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxKind::Deposit => "DEPOSIT",
            TxKind::Withdraw => "WITHDRAW",
            TxKind::TransferOut => "TRANSFER_OUT",
            TxKind::TransferIn => "TRANSFER_IN",
            TxKind::AdminSet => "ADMIN_SET",
        }
    }

    pub fn from_str(s: &str) -> Option<TxKind> {
        match s {
            "DEPOSIT" => Some(TxKind::Deposit),
            "WITHDRAW" => Some(TxKind::Withdraw),
            "TRANSFER_OUT" => Some(TxKind::TransferOut),
            "TRANSFER_IN" => Some(TxKind::TransferIn),
            "ADMIN_SET" => Some(TxKind::AdminSet),
            _ => None,
        }
    }
}

/// Append-only audit entry. `sequence` is the account sequence value that
/// produced it, so records totally order each account's history even when
/// timestamps collide.
#[derive(Debug, Clone)]
pub struct LedgerRecord {
    pub sequence: u64,
    pub kind: TxKind,
    pub delta: i64,
    pub resulting_balance: i64,
    pub timestamp: OffsetDateTime,
    pub actor: Arc<str>,
    pub reason: Arc<str>,
}

/// A fully-computed balance change handed to the backend. The backend writes
/// `new_balance` guarded by `expected_version` and appends the matching
/// ledger record inside one database transaction.
#[derive(Debug, Clone)]
pub struct Mutation {
    pub key: AccountKey,
    pub expected_version: u64,
    pub new_balance: i64,
    pub kind: TxKind,
    pub delta: i64,
    pub actor: Arc<str>,
    pub reason: Arc<str>,
}

/// Row state after a committed mutation.
#[derive(Debug, Clone, Copy)]
pub struct Applied {
    pub balance: i64,
    pub sequence: u64,
    pub version: u64,
}

/// Leaderboard entry.
#[derive(Debug, Clone)]
pub struct BalanceRanking {
    pub player: Uuid,
    pub balance: i64,
}

pub fn ts_to_unix(ts: OffsetDateTime) -> i64 {
    ts.unix_timestamp()
}

pub fn unix_to_ts(secs: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(secs).unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_keys_order_by_player_then_currency() {
        let a = AccountKey::new(Uuid::from_u128(1), Arc::from("coins"));
        let b = AccountKey::new(Uuid::from_u128(2), Arc::from("coins"));
        let c = AccountKey::new(Uuid::from_u128(1), Arc::from("gems"));
        assert!(a < b);
        assert!(a < c);
        assert!(c < b);
    }

    #[test]
    fn tx_kind_round_trips() {
        for kind in [
            TxKind::Deposit,
            TxKind::Withdraw,
            TxKind::TransferOut,
            TxKind::TransferIn,
            TxKind::AdminSet,
        ] {
            assert_eq!(TxKind::from_str(kind.as_str()), Some(kind));
        }
        assert_eq!(TxKind::from_str("BOGUS"), None);
    }

    #[test]
    fn unix_round_trip_clamps_garbage() {
        let now = OffsetDateTime::now_utc();
        let secs = ts_to_unix(now);
        assert_eq!(unix_to_ts(secs).unix_timestamp(), secs);
        assert_eq!(unix_to_ts(i64::MAX), OffsetDateTime::UNIX_EPOCH);
    }
}
