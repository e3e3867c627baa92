//! SQLite ledger backend.
//!
//! Payout records survive restarts here, including the retry schedule
//! (`next_attempt_at`), so background cancellation resumes where it stopped.
//! rusqlite is synchronous; every call runs on `spawn_blocking` against a single
//! connection behind a mutex.
//!
//! The schema enforces the write-once fields itself: a trigger aborts any update
//! to `transaction_id` or `reward_amount` once a transaction id exists, and
//! another refuses to delete a paid record.

use super::{Ledger, LedgerError, apply_attempt};
use crate::types::{
    AttemptOutcome, AttemptRecord, BountyIssue, IssueKey, PaymentAttemptLogEntry, PayoutStatus,
    Reservation,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::path::Path;
use std::sync::Arc;

const CURRENT_SCHEMA_VERSION: i64 = 2;

const ISSUE_COLUMNS: &str = "repository, issue_number, pull_request_number, assignee_login,
    payee_account_id, reward_amount, transaction_id, status, cancellation_attempts,
    last_attempt_at, next_attempt_at, cancellation_failed, created_at, payment_created_at";

pub struct SqliteLedger {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteLedger {
    /// Opens (creating if needed) the ledger database at `path`.
    ///
    /// The connection runs with `journal_mode = WAL` and `synchronous = FULL` so
    /// a committed attempt survives a crash.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, LedgerError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                LedgerError::storage("create database directory", format!("{}: {e}", parent.display()))
            })?;
        }

        let conn =
            Connection::open(path).map_err(|e| LedgerError::storage("open database", e))?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .map_err(|e| LedgerError::storage("set journal_mode", e))?;
        if !journal_mode.eq_ignore_ascii_case("wal") {
            return Err(LedgerError::storage(
                "configure journal_mode",
                format!("SQLite kept journal mode '{journal_mode}' instead of 'wal'"),
            ));
        }

        Self::init(conn)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, LedgerError> {
        let conn =
            Connection::open_in_memory().map_err(|e| LedgerError::storage("open database", e))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, LedgerError> {
        conn.execute_batch(
            r#"
            PRAGMA synchronous = FULL;
            PRAGMA busy_timeout = 5000;
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS schema_version (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                version INTEGER NOT NULL
            );
            "#,
        )
        .map_err(|e| LedgerError::storage("configure database", e))?;

        let current_version: i64 = conn
            .query_row("SELECT version FROM schema_version WHERE id = 1", [], |row| {
                row.get(0)
            })
            .optional()
            .map_err(|e| LedgerError::storage("get schema version", e))?
            .unwrap_or(0);

        Self::run_migrations(&conn, current_version)?;

        Ok(SqliteLedger {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn run_migrations(conn: &Connection, from_version: i64) -> Result<(), LedgerError> {
        if from_version > CURRENT_SCHEMA_VERSION {
            return Err(LedgerError::storage(
                "schema version",
                format!(
                    "database schema version {from_version} is newer than supported version {CURRENT_SCHEMA_VERSION}"
                ),
            ));
        }

        if from_version == CURRENT_SCHEMA_VERSION {
            return Ok(());
        }

        if from_version < 1 {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS bounty_issues (
                    repository TEXT NOT NULL,
                    issue_number INTEGER NOT NULL,
                    pull_request_number INTEGER NOT NULL,
                    assignee_login TEXT NOT NULL,
                    payee_account_id TEXT NOT NULL,
                    reward_amount INTEGER NOT NULL CHECK (reward_amount > 0),
                    transaction_id TEXT,
                    status TEXT NOT NULL,
                    cancellation_attempts INTEGER NOT NULL DEFAULT 0,
                    last_attempt_at INTEGER,
                    next_attempt_at INTEGER,
                    cancellation_failed INTEGER NOT NULL DEFAULT 0,
                    created_at INTEGER NOT NULL,
                    PRIMARY KEY (repository, issue_number)
                );

                CREATE INDEX IF NOT EXISTS idx_retry_due
                    ON bounty_issues(next_attempt_at) WHERE status = 'CancellationPending';
                CREATE INDEX IF NOT EXISTS idx_cancellation_failed
                    ON bounty_issues(cancellation_failed) WHERE cancellation_failed = 1;

                CREATE TABLE IF NOT EXISTS payment_attempts (
                    repository TEXT NOT NULL,
                    issue_number INTEGER NOT NULL,
                    attempt_number INTEGER NOT NULL,
                    outcome TEXT NOT NULL,
                    attempted_at INTEGER NOT NULL,
                    error_detail TEXT,
                    PRIMARY KEY (repository, issue_number, attempt_number),
                    FOREIGN KEY (repository, issue_number)
                        REFERENCES bounty_issues(repository, issue_number)
                );

                CREATE TRIGGER IF NOT EXISTS bounty_issues_write_once
                BEFORE UPDATE OF transaction_id, reward_amount ON bounty_issues
                WHEN OLD.transaction_id IS NOT NULL
                    AND (NEW.transaction_id IS NOT OLD.transaction_id
                         OR NEW.reward_amount IS NOT OLD.reward_amount)
                BEGIN
                    SELECT RAISE(ABORT, 'transaction_id and reward_amount are write-once');
                END;

                CREATE TRIGGER IF NOT EXISTS bounty_issues_keep_paid
                BEFORE DELETE ON bounty_issues
                WHEN OLD.transaction_id IS NOT NULL
                BEGIN
                    SELECT RAISE(ABORT, 'paid payout records cannot be deleted');
                END;
                "#,
            )
            .map_err(|e| LedgerError::storage("migration v1", e))?;
        }

        if from_version < 2 {
            conn.execute_batch(
                r#"
                ALTER TABLE bounty_issues ADD COLUMN payment_created_at INTEGER;

                CREATE INDEX IF NOT EXISTS idx_interrupted
                    ON bounty_issues(payment_created_at) WHERE status = 'PaymentCreated';
                "#,
            )
            .map_err(|e| LedgerError::storage("migration v2", e))?;
        }

        conn.execute(
            "INSERT OR REPLACE INTO schema_version (id, version) VALUES (1, ?1)",
            params![CURRENT_SCHEMA_VERSION],
        )
        .map_err(|e| LedgerError::storage("update schema version", e))?;

        Ok(())
    }

    async fn with_conn<T, F>(&self, operation: &'static str, f: F) -> Result<T, LedgerError>
    where
        F: FnOnce(&mut Connection) -> Result<T, LedgerError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock();
            f(&mut conn)
        })
        .await
        .map_err(|e| LedgerError::storage(operation, e))?
    }

    fn select_issues(
        conn: &Connection,
        operation: &'static str,
        filter: &str,
        args: impl rusqlite::Params,
    ) -> Result<Vec<BountyIssue>, LedgerError> {
        let sql = format!(
            "SELECT {ISSUE_COLUMNS} FROM bounty_issues WHERE {filter}
             ORDER BY created_at ASC, repository ASC, issue_number ASC"
        );
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| LedgerError::storage(operation, e))?;
        let rows = stmt
            .query_map(args, issue_from_row)
            .map_err(|e| LedgerError::storage(operation, e))?;

        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| LedgerError::Corruption(e.to_string()))
    }
}

/// SQLite integers are signed; values past `i64::MAX` would wrap.
fn sql_int(field: &'static str, value: u64) -> Result<i64, LedgerError> {
    i64::try_from(value).map_err(|_| LedgerError::OutOfRange { field, value })
}

fn get_issue(conn: &Connection, key: &IssueKey) -> Result<Option<BountyIssue>, LedgerError> {
    conn.query_row(
        &format!(
            "SELECT {ISSUE_COLUMNS} FROM bounty_issues WHERE repository = ?1 AND issue_number = ?2"
        ),
        params![key.repository, sql_int("issue_number", key.issue_number)?],
        issue_from_row,
    )
    .optional()
    .map_err(|e| match e {
        rusqlite::Error::FromSqlConversionFailure(..) => LedgerError::Corruption(e.to_string()),
        other => LedgerError::storage("get", other),
    })
}

#[derive(thiserror::Error, Debug)]
#[error("timestamp out of range: {0}")]
struct InvalidTimestamp(i64);

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Integer, Box::new(err))
}

fn unsigned(row: &Row<'_>, idx: usize) -> rusqlite::Result<u64> {
    let value: i64 = row.get(idx)?;
    u64::try_from(value).map_err(|e| conversion_error(idx, e))
}

fn timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let millis: i64 = row.get(idx)?;
    DateTime::from_timestamp_millis(millis).ok_or_else(|| conversion_error(idx, InvalidTimestamp(millis)))
}

fn optional_timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<i64>>(idx)? {
        Some(_) => timestamp(row, idx).map(Some),
        None => Ok(None),
    }
}

fn issue_from_row(row: &Row<'_>) -> rusqlite::Result<BountyIssue> {
    let repository: String = row.get(0)?;
    let status: String = row.get(7)?;
    let status = status
        .parse::<PayoutStatus>()
        .map_err(|e| conversion_error(7, e))?;
    let cancellation_attempts = u32::try_from(unsigned(row, 8)?).map_err(|e| conversion_error(8, e))?;

    Ok(BountyIssue {
        key: IssueKey {
            repository,
            issue_number: unsigned(row, 1)?,
        },
        pull_request_number: unsigned(row, 2)?,
        assignee_login: row.get(3)?,
        payee_account_id: row.get(4)?,
        reward_amount: unsigned(row, 5)?,
        transaction_id: row.get(6)?,
        status,
        cancellation_attempts,
        last_attempt_at: optional_timestamp(row, 9)?,
        next_attempt_at: optional_timestamp(row, 10)?,
        cancellation_failed: row.get(11)?,
        created_at: timestamp(row, 12)?,
        payment_created_at: optional_timestamp(row, 13)?,
    })
}

fn attempt_from_row(row: &Row<'_>) -> rusqlite::Result<PaymentAttemptLogEntry> {
    let outcome: String = row.get(3)?;
    let outcome = outcome
        .parse::<AttemptOutcome>()
        .map_err(|e| conversion_error(3, e))?;

    Ok(PaymentAttemptLogEntry {
        key: IssueKey {
            repository: row.get(0)?,
            issue_number: unsigned(row, 1)?,
        },
        attempt_number: u32::try_from(unsigned(row, 2)?).map_err(|e| conversion_error(2, e))?,
        outcome,
        timestamp: timestamp(row, 4)?,
        error_detail: row.get(5)?,
    })
}

#[async_trait]
impl Ledger for SqliteLedger {
    async fn get(&self, key: &IssueKey) -> Result<Option<BountyIssue>, LedgerError> {
        let key = key.clone();
        self.with_conn("get", move |conn| get_issue(conn, &key)).await
    }

    async fn create_if_absent(&self, reservation: Reservation) -> Result<BountyIssue, LedgerError> {
        self.with_conn("create_if_absent", move |conn| {
            let issue = BountyIssue::reserved(reservation);
            let issue_number = sql_int("issue_number", issue.key.issue_number)?;
            let pull_request_number = sql_int("pull_request_number", issue.pull_request_number)?;
            let reward_amount = sql_int("reward_amount", issue.reward_amount)?;

            // A single conditional insert; the primary key serializes racing requests.
            let inserted = conn
                .execute(
                    "INSERT INTO bounty_issues (repository, issue_number, pull_request_number,
                         assignee_login, payee_account_id, reward_amount, status, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                     ON CONFLICT(repository, issue_number) DO NOTHING",
                    params![
                        issue.key.repository,
                        issue_number,
                        pull_request_number,
                        issue.assignee_login,
                        issue.payee_account_id,
                        reward_amount,
                        issue.status.as_str(),
                        issue.created_at.timestamp_millis(),
                    ],
                )
                .map_err(|e| LedgerError::storage("create_if_absent", e))?;

            if inserted == 0 {
                return Err(LedgerError::AlreadyExists(issue.key));
            }
            Ok(issue)
        })
        .await
    }

    async fn release(&self, key: &IssueKey) -> Result<(), LedgerError> {
        let key = key.clone();
        self.with_conn("release", move |conn| {
            let issue_number = sql_int("issue_number", key.issue_number)?;
            let deleted = conn
                .execute(
                    "DELETE FROM bounty_issues
                     WHERE repository = ?1 AND issue_number = ?2
                       AND status = 'Unpaid' AND transaction_id IS NULL",
                    params![key.repository, issue_number],
                )
                .map_err(|e| LedgerError::storage("release", e))?;

            if deleted == 0 {
                return match get_issue(conn, &key)? {
                    Some(_) => Err(LedgerError::ReleaseRefused(key)),
                    None => Err(LedgerError::NotFound(key)),
                };
            }
            Ok(())
        })
        .await
    }

    async fn record_transaction(
        &self,
        key: &IssueKey,
        transaction_id: &str,
    ) -> Result<BountyIssue, LedgerError> {
        let key = key.clone();
        let transaction_id = transaction_id.to_string();
        self.with_conn("record_transaction", move |conn| {
            let issue_number = sql_int("issue_number", key.issue_number)?;
            let updated = conn
                .execute(
                    "UPDATE bounty_issues
                     SET transaction_id = ?3, payment_created_at = ?4, status = 'PaymentCreated'
                     WHERE repository = ?1 AND issue_number = ?2
                       AND status = 'Unpaid' AND transaction_id IS NULL",
                    params![
                        key.repository,
                        issue_number,
                        transaction_id,
                        Utc::now().timestamp_millis(),
                    ],
                )
                .map_err(|e| LedgerError::storage("record_transaction", e))?;

            match (updated, get_issue(conn, &key)?) {
                (0, Some(_)) => Err(LedgerError::TransactionAlreadyRecorded(key)),
                (_, Some(issue)) => Ok(issue),
                (_, None) => Err(LedgerError::NotFound(key)),
            }
        })
        .await
    }

    async fn append_attempt(
        &self,
        key: &IssueKey,
        attempt: AttemptRecord,
    ) -> Result<BountyIssue, LedgerError> {
        let key = key.clone();
        self.with_conn("append_attempt", move |conn| {
            let tx = conn
                .transaction()
                .map_err(|e| LedgerError::storage("append_attempt", e))?;

            let issue_number = sql_int("issue_number", key.issue_number)?;
            let mut issue =
                get_issue(&tx, &key)?.ok_or_else(|| LedgerError::NotFound(key.clone()))?;
            let entry = apply_attempt(&mut issue, &attempt)?;

            tx.execute(
                "UPDATE bounty_issues
                 SET status = ?3, cancellation_attempts = ?4, last_attempt_at = ?5,
                     next_attempt_at = ?6, cancellation_failed = ?7
                 WHERE repository = ?1 AND issue_number = ?2",
                params![
                    key.repository,
                    issue_number,
                    issue.status.as_str(),
                    i64::from(issue.cancellation_attempts),
                    issue.last_attempt_at.map(|t| t.timestamp_millis()),
                    issue.next_attempt_at.map(|t| t.timestamp_millis()),
                    issue.cancellation_failed,
                ],
            )
            .map_err(|e| LedgerError::storage("append_attempt", e))?;

            tx.execute(
                "INSERT INTO payment_attempts (repository, issue_number, attempt_number,
                     outcome, attempted_at, error_detail)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    key.repository,
                    issue_number,
                    i64::from(entry.attempt_number),
                    entry.outcome.as_str(),
                    entry.timestamp.timestamp_millis(),
                    entry.error_detail,
                ],
            )
            .map_err(|e| LedgerError::storage("append_attempt", e))?;

            tx.commit()
                .map_err(|e| LedgerError::storage("append_attempt", e))?;
            Ok(issue)
        })
        .await
    }

    async fn attempts(&self, key: &IssueKey) -> Result<Vec<PaymentAttemptLogEntry>, LedgerError> {
        let key = key.clone();
        self.with_conn("attempts", move |conn| {
            let issue_number = sql_int("issue_number", key.issue_number)?;
            let mut stmt = conn
                .prepare(
                    "SELECT repository, issue_number, attempt_number, outcome, attempted_at, error_detail
                     FROM payment_attempts
                     WHERE repository = ?1 AND issue_number = ?2
                     ORDER BY attempt_number ASC",
                )
                .map_err(|e| LedgerError::storage("attempts", e))?;
            let rows = stmt
                .query_map(params![key.repository, issue_number], attempt_from_row)
                .map_err(|e| LedgerError::storage("attempts", e))?;

            rows.collect::<Result<Vec<_>, _>>()
                .map_err(|e| LedgerError::Corruption(e.to_string()))
        })
        .await
    }

    async fn list_failed(&self) -> Result<Vec<BountyIssue>, LedgerError> {
        self.with_conn("list_failed", |conn| {
            Self::select_issues(conn, "list_failed", "cancellation_failed = 1", [])
        })
        .await
    }

    async fn due_for_retry(&self, now: DateTime<Utc>) -> Result<Vec<BountyIssue>, LedgerError> {
        self.with_conn("due_for_retry", move |conn| {
            Self::select_issues(
                conn,
                "due_for_retry",
                "status = 'CancellationPending' AND (next_attempt_at IS NULL OR next_attempt_at <= ?1)",
                params![now.timestamp_millis()],
            )
        })
        .await
    }

    async fn interrupted(
        &self,
        created_before: DateTime<Utc>,
    ) -> Result<Vec<BountyIssue>, LedgerError> {
        self.with_conn("interrupted", move |conn| {
            Self::select_issues(
                conn,
                "interrupted",
                "status = 'PaymentCreated'
                 AND (payment_created_at IS NULL OR payment_created_at <= ?1)",
                params![created_before.timestamp_millis()],
            )
        })
        .await
    }
}
