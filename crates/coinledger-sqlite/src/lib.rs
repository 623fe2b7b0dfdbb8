//! Embedded single-file [`LedgerBackend`] over SQLite.
//!
//! Connections run in WAL mode with `synchronous=NORMAL` and a busy
//! timeout, so several pooled connections can interleave writers without
//! spurious `SQLITE_BUSY` failures.

use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use time::OffsetDateTime;
use uuid::Uuid;

use coinledger_core::models::{ts_to_unix, unix_to_ts};
use coinledger_core::{
    Account, AccountKey, Applied, BalanceRanking, ConnectionManager, LedgerBackend, LedgerError,
    LedgerRecord, Mutation, Pool, PoolSettings, TxKind, SCHEMA_VERSION,
};

pub const MEMORY_PATH: &str = ":memory:";

/// Forward-only migrations. `ensure_schema` applies every entry newer than
/// the version recorded in `schema_migrations`, each in its own
/// transaction.
const MIGRATIONS: &[(i64, &str, &str)] = &[
    (
        1,
        "accounts and transactions tables",
        "
        CREATE TABLE IF NOT EXISTS accounts (
            uuid TEXT NOT NULL,
            currency TEXT NOT NULL,
            balance INTEGER NOT NULL DEFAULT 0,
            sequence INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (uuid, currency)
        );

        CREATE TABLE IF NOT EXISTS transactions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            uuid TEXT NOT NULL,
            currency TEXT NOT NULL,
            sequence INTEGER NOT NULL,
            kind TEXT NOT NULL,
            delta INTEGER NOT NULL,
            resulting_balance INTEGER NOT NULL,
            actor TEXT NOT NULL,
            reason TEXT NOT NULL,
            created_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_transactions_account
            ON transactions(uuid, currency, sequence);
        ",
    ),
    (
        2,
        "optimistic concurrency token on accounts",
        "ALTER TABLE accounts ADD COLUMN version INTEGER NOT NULL DEFAULT 0;",
    ),
];

pub struct SqliteManager {
    path: String,
}

impl ConnectionManager for SqliteManager {
    type Connection = Connection;

    fn connect(&self) -> Result<Connection, LedgerError> {
        let conn = if self.path == MEMORY_PATH {
            Connection::open_in_memory()
        } else {
            Connection::open(&self.path)
        }
        .map_err(map_err)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA foreign_keys=ON;
             PRAGMA busy_timeout=5000;",
        )
        .map_err(map_err)?;
        Ok(conn)
    }

    fn is_valid(&self, conn: &mut Connection) -> bool {
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0)).is_ok()
    }
}

pub struct SqliteBackend {
    pool: Pool<SqliteManager>,
}

impl SqliteBackend {
    pub fn open(path: &str, mut settings: PoolSettings) -> Result<Self, LedgerError> {
        if path == MEMORY_PATH {
            // every in-memory connection is a separate database
            settings.max_size = 1;
        }
        let pool = Pool::new(SqliteManager { path: path.to_string() }, settings)?;
        Ok(Self { pool })
    }

    fn with_conn<T>(
        &self,
        op: impl FnOnce(&mut Connection) -> Result<T, LedgerError>,
    ) -> Result<T, LedgerError> {
        let mut conn = self.pool.acquire()?;
        let result = op(&mut conn);
        if matches!(result, Err(LedgerError::BackendUnavailable(_))) {
            conn.mark_broken();
        }
        result
    }
}

fn map_err(e: rusqlite::Error) -> LedgerError {
    match &e {
        rusqlite::Error::SqliteFailure(err, msg) => {
            let context = msg.clone().unwrap_or_else(|| err.to_string());
            match err.code {
                ErrorCode::ConstraintViolation => LedgerError::ConstraintViolation(context),
                _ => LedgerError::BackendUnavailable(context),
            }
        }
        other => LedgerError::BackendUnavailable(other.to_string()),
    }
}

fn migrations_table(conn: &Connection) -> Result<(), LedgerError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at INTEGER NOT NULL
        );",
    )
    .map_err(map_err)
}

fn current_version(conn: &Connection) -> Result<i64, LedgerError> {
    conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
        row.get(0)
    })
    .map_err(map_err)
}

fn read_account(conn: &Connection, key: &AccountKey) -> Result<Option<Account>, LedgerError> {
    let row = conn
        .query_row(
            "SELECT balance, sequence, version, created_at, updated_at
             FROM accounts WHERE uuid = ?1 AND currency = ?2",
            params![key.player.to_string(), key.currency.as_ref()],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            },
        )
        .optional()
        .map_err(map_err)?;
    Ok(row.map(|(balance, sequence, version, created_at, updated_at)| Account {
        key: key.clone(),
        balance,
        sequence: sequence as u64,
        version: version as u64,
        created_at: unix_to_ts(created_at),
        updated_at: unix_to_ts(updated_at),
    }))
}

/// One mutation leg inside an already-open transaction: the guarded balance
/// write plus the matching ledger record.
fn apply_leg(
    tx: &rusqlite::Transaction<'_>,
    mutation: &Mutation,
    now: OffsetDateTime,
) -> Result<Applied, LedgerError> {
    let uuid = mutation.key.player.to_string();
    let currency = mutation.key.currency.as_ref();
    let updated = tx
        .execute(
            "UPDATE accounts
             SET balance = ?1, sequence = sequence + 1, version = version + 1, updated_at = ?2
             WHERE uuid = ?3 AND currency = ?4 AND version = ?5",
            params![
                mutation.new_balance,
                ts_to_unix(now),
                uuid,
                currency,
                mutation.expected_version as i64
            ],
        )
        .map_err(map_err)?;
    if updated == 0 {
        let exists: bool = tx
            .query_row(
                "SELECT COUNT(*) > 0 FROM accounts WHERE uuid = ?1 AND currency = ?2",
                params![uuid, currency],
                |row| row.get(0),
            )
            .map_err(map_err)?;
        return Err(if exists {
            LedgerError::StaleVersion
        } else {
            LedgerError::AccountNotFound(mutation.key.to_string())
        });
    }
    let (sequence, version): (i64, i64) = tx
        .query_row(
            "SELECT sequence, version FROM accounts WHERE uuid = ?1 AND currency = ?2",
            params![uuid, currency],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .map_err(map_err)?;
    tx.execute(
        "INSERT INTO transactions
            (uuid, currency, sequence, kind, delta, resulting_balance, actor, reason, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            uuid,
            currency,
            sequence,
            mutation.kind.as_str(),
            mutation.delta,
            mutation.new_balance,
            mutation.actor.as_ref(),
            mutation.reason.as_ref(),
            ts_to_unix(now)
        ],
    )
    .map_err(map_err)?;
    Ok(Applied {
        balance: mutation.new_balance,
        sequence: sequence as u64,
        version: version as u64,
    })
}

impl LedgerBackend for SqliteBackend {
    fn ensure_schema(&self) -> Result<(), LedgerError> {
        self.with_conn(|conn| {
            migrations_table(conn)?;
            let current = current_version(conn)?;
            if current > SCHEMA_VERSION {
                return Err(LedgerError::IncompatibleSchemaVersion {
                    found: current,
                    supported: SCHEMA_VERSION,
                });
            }
            for (version, description, sql) in MIGRATIONS {
                if *version <= current {
                    continue;
                }
                let tx = conn.transaction().map_err(map_err)?;
                tx.execute_batch(sql).map_err(map_err)?;
                tx.execute(
                    "INSERT INTO schema_migrations (version, description, applied_at)
                     VALUES (?1, ?2, ?3)",
                    params![version, description, ts_to_unix(OffsetDateTime::now_utc())],
                )
                .map_err(map_err)?;
                tx.commit().map_err(map_err)?;
                tracing::info!(version, description, "applied schema migration");
            }
            Ok(())
        })
    }

    fn schema_version(&self) -> Result<i64, LedgerError> {
        self.with_conn(|conn| {
            migrations_table(conn)?;
            current_version(conn)
        })
    }

    fn load_account(&self, key: &AccountKey) -> Result<Option<Account>, LedgerError> {
        self.with_conn(|conn| read_account(conn, key))
    }

    fn create_account(
        &self,
        key: &AccountKey,
        starting_balance: i64,
    ) -> Result<Account, LedgerError> {
        self.with_conn(|conn| {
            let now = ts_to_unix(OffsetDateTime::now_utc());
            conn.execute(
                "INSERT INTO accounts (uuid, currency, balance, sequence, version, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 0, 0, ?4, ?4)
                 ON CONFLICT(uuid, currency) DO NOTHING",
                params![key.player.to_string(), key.currency.as_ref(), starting_balance, now],
            )
            .map_err(map_err)?;
            read_account(conn, key)?
                .ok_or_else(|| LedgerError::AccountNotFound(key.to_string()))
        })
    }

    fn apply_mutation(&self, mutation: &Mutation) -> Result<Applied, LedgerError> {
        self.with_conn(|conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(map_err)?;
            let applied = apply_leg(&tx, mutation, OffsetDateTime::now_utc())?;
            tx.commit().map_err(map_err)?;
            Ok(applied)
        })
    }

    fn apply_transfer(
        &self,
        debit: &Mutation,
        credit: &Mutation,
    ) -> Result<(Applied, Applied), LedgerError> {
        self.with_conn(|conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(map_err)?;
            let now = OffsetDateTime::now_utc();
            let debit_applied = apply_leg(&tx, debit, now)?;
            let credit_applied = apply_leg(&tx, credit, now)?;
            tx.commit().map_err(map_err)?;
            Ok((debit_applied, credit_applied))
        })
    }

    fn history(&self, key: &AccountKey, limit: usize) -> Result<Vec<LedgerRecord>, LedgerError> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT sequence, kind, delta, resulting_balance, actor, reason, created_at
                     FROM transactions
                     WHERE uuid = ?1 AND currency = ?2
                     ORDER BY sequence DESC
                     LIMIT ?3",
                )
                .map_err(map_err)?;
            let rows: Vec<(i64, String, i64, i64, String, String, i64)> = stmt
                .query_map(
                    params![key.player.to_string(), key.currency.as_ref(), limit as i64],
                    |row| {
                        Ok((
                            row.get(0)?,
                            row.get(1)?,
                            row.get(2)?,
                            row.get(3)?,
                            row.get(4)?,
                            row.get(5)?,
                            row.get(6)?,
                        ))
                    },
                )
                .map_err(map_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(map_err)?;

            let mut records = Vec::with_capacity(rows.len());
            for (sequence, kind, delta, resulting_balance, actor, reason, created_at) in rows {
                let kind = TxKind::from_str(&kind).ok_or_else(|| {
                    LedgerError::ConstraintViolation(format!("unknown ledger record kind: {kind}"))
                })?;
                records.push(LedgerRecord {
                    sequence: sequence as u64,
                    kind,
                    delta,
                    resulting_balance,
                    timestamp: unix_to_ts(created_at),
                    actor: actor.into(),
                    reason: reason.into(),
                });
            }
            Ok(records)
        })
    }

    fn wipe_account(&self, key: &AccountKey) -> Result<(), LedgerError> {
        self.with_conn(|conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(map_err)?;
            let uuid = key.player.to_string();
            tx.execute(
                "DELETE FROM transactions WHERE uuid = ?1 AND currency = ?2",
                params![uuid, key.currency.as_ref()],
            )
            .map_err(map_err)?;
            let deleted = tx
                .execute(
                    "DELETE FROM accounts WHERE uuid = ?1 AND currency = ?2",
                    params![uuid, key.currency.as_ref()],
                )
                .map_err(map_err)?;
            if deleted == 0 {
                return Err(LedgerError::AccountNotFound(key.to_string()));
            }
            tx.commit().map_err(map_err)?;
            tracing::info!(account = %key, "wiped account and its ledger records");
            Ok(())
        })
    }

    fn top_balances(
        &self,
        currency: &str,
        limit: usize,
    ) -> Result<Vec<BalanceRanking>, LedgerError> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT uuid, balance FROM accounts
                     WHERE currency = ?1
                     ORDER BY balance DESC
                     LIMIT ?2",
                )
                .map_err(map_err)?;
            let rows: Vec<(String, i64)> = stmt
                .query_map(params![currency, limit as i64], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })
                .map_err(map_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(map_err)?;

            let mut rankings = Vec::with_capacity(rows.len());
            for (uuid, balance) in rows {
                let player = Uuid::parse_str(&uuid).map_err(|_| {
                    LedgerError::ConstraintViolation(format!("malformed uuid in accounts row: {uuid}"))
                })?;
                rankings.push(BalanceRanking { player, balance });
            }
            Ok(rankings)
        })
    }

    fn total_balance(&self, currency: &str) -> Result<i64, LedgerError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT COALESCE(SUM(balance), 0) FROM accounts WHERE currency = ?1",
                params![currency],
                |row| row.get(0),
            )
            .map_err(map_err)
        })
    }
}
