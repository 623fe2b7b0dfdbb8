//! Networked [`LedgerBackend`] for the MySQL wire protocol.
//!
//! One driver covers both supported server variants; MySQL and MariaDB are
//! wire-compatible, so the configured [`Flavor`] only identifies the server
//! for logging and diagnostics, the way the original deployment picked
//! between two interchangeable JDBC drivers.

use mysql::prelude::Queryable;
use mysql::{Conn, OptsBuilder};
use time::OffsetDateTime;
use uuid::Uuid;

use coinledger_core::models::{ts_to_unix, unix_to_ts};
use coinledger_core::{
    Account, AccountKey, Applied, BalanceRanking, ConnectionManager, LedgerBackend, LedgerError,
    LedgerRecord, Mutation, Pool, PoolSettings, TxKind, SCHEMA_VERSION,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flavor {
    MySql,
    MariaDb,
}

impl Flavor {
    pub fn label(&self) -> &'static str {
        match self {
            Flavor::MySql => "mysql",
            Flavor::MariaDb => "mariadb",
        }
    }
}

pub const DEFAULT_PORT: u16 = 3306;

#[derive(Debug, Clone)]
pub struct MysqlSettings {
    pub flavor: Flavor,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
}

/// Forward-only migrations; every entry newer than the recorded version is
/// applied statement by statement inside one transaction.
const MIGRATIONS: &[(i64, &str, &[&str])] = &[
    (
        1,
        "accounts and transactions tables",
        &[
            "CREATE TABLE IF NOT EXISTS accounts (
                uuid VARCHAR(36) NOT NULL,
                currency VARCHAR(32) NOT NULL,
                balance BIGINT NOT NULL DEFAULT 0,
                `sequence` BIGINT NOT NULL DEFAULT 0,
                created_at BIGINT NOT NULL,
                updated_at BIGINT NOT NULL,
                PRIMARY KEY (uuid, currency),
                INDEX idx_accounts_balance (currency, balance)
            ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4 COLLATE=utf8mb4_unicode_ci",
            "CREATE TABLE IF NOT EXISTS transactions (
                id BIGINT AUTO_INCREMENT PRIMARY KEY,
                uuid VARCHAR(36) NOT NULL,
                currency VARCHAR(32) NOT NULL,
                `sequence` BIGINT NOT NULL,
                kind VARCHAR(20) NOT NULL,
                delta BIGINT NOT NULL,
                resulting_balance BIGINT NOT NULL,
                actor VARCHAR(64) NOT NULL,
                reason TEXT NOT NULL,
                created_at BIGINT NOT NULL,
                INDEX idx_transactions_account (uuid, currency, `sequence`)
            ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4 COLLATE=utf8mb4_unicode_ci",
        ],
    ),
    (
        2,
        "optimistic concurrency token on accounts",
        &["ALTER TABLE accounts ADD COLUMN version BIGINT NOT NULL DEFAULT 0"],
    ),
];

pub struct MysqlManager {
    settings: MysqlSettings,
}

impl ConnectionManager for MysqlManager {
    type Connection = Conn;

    fn connect(&self) -> Result<Conn, LedgerError> {
        let opts = OptsBuilder::new()
            .ip_or_hostname(Some(self.settings.host.clone()))
            .tcp_port(self.settings.port)
            .db_name(Some(self.settings.database.clone()))
            .user(Some(self.settings.username.clone()))
            .pass(Some(self.settings.password.clone()));
        let mut conn = Conn::new(opts).map_err(map_err)?;
        conn.query_drop("SET NAMES utf8mb4").map_err(map_err)?;
        tracing::debug!(flavor = self.settings.flavor.label(), "opened server connection");
        Ok(conn)
    }

    fn is_valid(&self, conn: &mut Conn) -> bool {
        conn.query_drop("SELECT 1").is_ok()
    }
}

pub struct MysqlBackend {
    pool: Pool<MysqlManager>,
    flavor: Flavor,
}

impl MysqlBackend {
    pub fn connect(settings: MysqlSettings, pool: PoolSettings) -> Result<Self, LedgerError> {
        let flavor = settings.flavor;
        let pool = Pool::new(MysqlManager { settings }, pool)?;
        tracing::info!(flavor = flavor.label(), "connected to networked backend");
        Ok(Self { pool, flavor })
    }

    pub fn flavor(&self) -> Flavor {
        self.flavor
    }

    fn with_conn<T>(
        &self,
        op: impl FnOnce(&mut Conn) -> Result<T, LedgerError>,
    ) -> Result<T, LedgerError> {
        let mut conn = self.pool.acquire()?;
        let result = op(&mut conn);
        if matches!(result, Err(LedgerError::BackendUnavailable(_))) {
            conn.mark_broken();
        }
        result
    }
}

fn map_err(e: mysql::Error) -> LedgerError {
    match e {
        mysql::Error::MySqlError(server) => match server.code {
            // lock wait timeout, deadlock, server gone, lost connection
            1205 | 1213 | 2006 | 2013 => LedgerError::BackendUnavailable(server.message),
            _ => LedgerError::ConstraintViolation(server.message),
        },
        other => LedgerError::BackendUnavailable(other.to_string()),
    }
}

fn in_transaction<T>(
    conn: &mut Conn,
    op: impl FnOnce(&mut Conn) -> Result<T, LedgerError>,
) -> Result<T, LedgerError> {
    conn.query_drop("START TRANSACTION").map_err(map_err)?;
    match op(conn) {
        Ok(value) => {
            conn.query_drop("COMMIT").map_err(map_err)?;
            Ok(value)
        }
        Err(e) => {
            let _ = conn.query_drop("ROLLBACK");
            Err(e)
        }
    }
}

fn migrations_table(conn: &mut Conn) -> Result<(), LedgerError> {
    conn.query_drop(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version BIGINT PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at BIGINT NOT NULL
        ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4",
    )
    .map_err(map_err)
}

fn current_version(conn: &mut Conn) -> Result<i64, LedgerError> {
    let version: Option<i64> = conn
        .query_first("SELECT COALESCE(MAX(version), 0) FROM schema_migrations")
        .map_err(map_err)?;
    Ok(version.unwrap_or(0))
}

fn read_account(conn: &mut Conn, key: &AccountKey) -> Result<Option<Account>, LedgerError> {
    let row: Option<(i64, i64, i64, i64, i64)> = conn
        .exec_first(
            "SELECT balance, `sequence`, version, created_at, updated_at
             FROM accounts WHERE uuid = ? AND currency = ?",
            (key.player.to_string(), key.currency.as_ref()),
        )
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

fn apply_leg(conn: &mut Conn, mutation: &Mutation, now: OffsetDateTime) -> Result<Applied, LedgerError> {
    let uuid = mutation.key.player.to_string();
    let currency = mutation.key.currency.as_ref();
    conn.exec_drop(
        "UPDATE accounts
         SET balance = ?, `sequence` = `sequence` + 1, version = version + 1, updated_at = ?
         WHERE uuid = ? AND currency = ? AND version = ?",
        (
            mutation.new_balance,
            ts_to_unix(now),
            uuid.as_str(),
            currency,
            mutation.expected_version,
        ),
    )
    .map_err(map_err)?;
    if conn.affected_rows() == 0 {
        let count: Option<i64> = conn
            .exec_first(
                "SELECT COUNT(*) FROM accounts WHERE uuid = ? AND currency = ?",
                (uuid.as_str(), currency),
            )
            .map_err(map_err)?;
        return Err(if count.unwrap_or(0) > 0 {
            LedgerError::StaleVersion
        } else {
            LedgerError::AccountNotFound(mutation.key.to_string())
        });
    }
    let (sequence, version): (i64, i64) = conn
        .exec_first(
            "SELECT `sequence`, version FROM accounts WHERE uuid = ? AND currency = ?",
            (uuid.as_str(), currency),
        )
        .map_err(map_err)?
        .ok_or_else(|| LedgerError::AccountNotFound(mutation.key.to_string()))?;
    conn.exec_drop(
        "INSERT INTO transactions
            (uuid, currency, `sequence`, kind, delta, resulting_balance, actor, reason, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            uuid.as_str(),
            currency,
            sequence,
            mutation.kind.as_str(),
            mutation.delta,
            mutation.new_balance,
            mutation.actor.as_ref(),
            mutation.reason.as_ref(),
            ts_to_unix(now),
        ),
    )
    .map_err(map_err)?;
    Ok(Applied {
        balance: mutation.new_balance,
        sequence: sequence as u64,
        version: version as u64,
    })
}

impl LedgerBackend for MysqlBackend {
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
            for (version, description, statements) in MIGRATIONS {
                if *version <= current {
                    continue;
                }
                in_transaction(conn, |conn| {
                    for statement in *statements {
                        conn.query_drop(*statement).map_err(map_err)?;
                    }
                    conn.exec_drop(
                        "INSERT INTO schema_migrations (version, description, applied_at)
                         VALUES (?, ?, ?)",
                        (*version, *description, ts_to_unix(OffsetDateTime::now_utc())),
                    )
                    .map_err(map_err)
                })?;
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
            conn.exec_drop(
                "INSERT INTO accounts (uuid, currency, balance, `sequence`, version, created_at, updated_at)
                 VALUES (?, ?, ?, 0, 0, ?, ?)
                 ON DUPLICATE KEY UPDATE uuid = uuid",
                (
                    key.player.to_string(),
                    key.currency.as_ref(),
                    starting_balance,
                    now,
                    now,
                ),
            )
            .map_err(map_err)?;
            read_account(conn, key)?
                .ok_or_else(|| LedgerError::AccountNotFound(key.to_string()))
        })
    }

    fn apply_mutation(&self, mutation: &Mutation) -> Result<Applied, LedgerError> {
        self.with_conn(|conn| {
            in_transaction(conn, |conn| apply_leg(conn, mutation, OffsetDateTime::now_utc()))
        })
    }

    fn apply_transfer(
        &self,
        debit: &Mutation,
        credit: &Mutation,
    ) -> Result<(Applied, Applied), LedgerError> {
        self.with_conn(|conn| {
            in_transaction(conn, |conn| {
                let now = OffsetDateTime::now_utc();
                let debit_applied = apply_leg(conn, debit, now)?;
                let credit_applied = apply_leg(conn, credit, now)?;
                Ok((debit_applied, credit_applied))
            })
        })
    }

    fn history(&self, key: &AccountKey, limit: usize) -> Result<Vec<LedgerRecord>, LedgerError> {
        self.with_conn(|conn| {
            let rows: Vec<(i64, String, i64, i64, String, String, i64)> = conn
                .exec(
                    "SELECT `sequence`, kind, delta, resulting_balance, actor, reason, created_at
                     FROM transactions
                     WHERE uuid = ? AND currency = ?
                     ORDER BY `sequence` DESC
                     LIMIT ?",
                    (key.player.to_string(), key.currency.as_ref(), limit as u64),
                )
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
            in_transaction(conn, |conn| {
                let uuid = key.player.to_string();
                conn.exec_drop(
                    "DELETE FROM transactions WHERE uuid = ? AND currency = ?",
                    (uuid.as_str(), key.currency.as_ref()),
                )
                .map_err(map_err)?;
                conn.exec_drop(
                    "DELETE FROM accounts WHERE uuid = ? AND currency = ?",
                    (uuid.as_str(), key.currency.as_ref()),
                )
                .map_err(map_err)?;
                if conn.affected_rows() == 0 {
                    return Err(LedgerError::AccountNotFound(key.to_string()));
                }
                Ok(())
            })?;
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
            let rows: Vec<(String, i64)> = conn
                .exec(
                    "SELECT uuid, balance FROM accounts
                     WHERE currency = ?
                     ORDER BY balance DESC
                     LIMIT ?",
                    (currency, limit as u64),
                )
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
            let total: Option<i64> = conn
                .exec_first(
                    "SELECT CAST(COALESCE(SUM(balance), 0) AS SIGNED) FROM accounts WHERE currency = ?",
                    (currency,),
                )
                .map_err(map_err)?;
            Ok(total.unwrap_or(0))
        })
    }
}
