//! The idempotency ledger: the single source of truth for whether an issue has
//! been paid, and the only component that mutates payout state.

mod memory;
mod sqlite;

pub use memory::MemoryLedger;
pub use sqlite::SqliteLedger;

use crate::config::LedgerConfig;
use crate::types::{
    AttemptRecord, BountyIssue, IssueKey, PaymentAttemptLogEntry, PayoutStatus, Reservation,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

#[derive(thiserror::Error, Debug)]
pub enum LedgerError {
    #[error("a payout record already exists for {0}")]
    AlreadyExists(IssueKey),

    #[error("no payout record exists for {0}")]
    NotFound(IssueKey),

    #[error("a transaction id is already recorded for {0}")]
    TransactionAlreadyRecorded(IssueKey),

    #[error("refusing to release {0}: payment may have been created")]
    ReleaseRefused(IssueKey),

    #[error("invalid status transition for {key}: {from} -> {to}")]
    InvalidTransition {
        key: IssueKey,
        from: PayoutStatus,
        to: PayoutStatus,
    },

    #[error("storage error during {operation}: {message}")]
    Storage { operation: String, message: String },

    #[error("{field} {value} exceeds the ledger's integer range")]
    OutOfRange { field: &'static str, value: u64 },

    #[error("corrupt ledger data: {0}")]
    Corruption(String),
}

impl LedgerError {
    pub(crate) fn storage(operation: &str, message: impl ToString) -> Self {
        LedgerError::Storage {
            operation: operation.to_string(),
            message: message.to_string(),
        }
    }
}

#[async_trait]
pub trait Ledger: Send + Sync {
    async fn get(&self, key: &IssueKey) -> Result<Option<BountyIssue>, LedgerError>;

    /// Atomically reserves `reservation.key` in `Unpaid` state. Fails with
    /// `AlreadyExists` without waiting if any record holds the key.
    async fn create_if_absent(&self, reservation: Reservation) -> Result<BountyIssue, LedgerError>;

    /// Drops an `Unpaid` reservation that never acquired a transaction id.
    async fn release(&self, key: &IssueKey) -> Result<(), LedgerError>;

    /// Sets the write-once transaction id, stamps `payment_created_at` and moves
    /// `Unpaid -> PaymentCreated`.
    async fn record_transaction(
        &self,
        key: &IssueKey,
        transaction_id: &str,
    ) -> Result<BountyIssue, LedgerError>;

    /// Records one cancellation attempt in a single transaction: bumps the
    /// attempt counter, stamps `last_attempt_at`, appends to the audit log and
    /// applies the status decided by the retry engine. A record that already
    /// settled keeps its status; the attempt is still logged.
    async fn append_attempt(
        &self,
        key: &IssueKey,
        attempt: AttemptRecord,
    ) -> Result<BountyIssue, LedgerError>;

    async fn attempts(&self, key: &IssueKey) -> Result<Vec<PaymentAttemptLogEntry>, LedgerError>;

    /// Records flagged `cancellation_failed`, oldest first.
    async fn list_failed(&self) -> Result<Vec<BountyIssue>, LedgerError>;

    /// `CancellationPending` records whose next attempt is due at `now`.
    async fn due_for_retry(&self, now: DateTime<Utc>) -> Result<Vec<BountyIssue>, LedgerError>;

    /// `PaymentCreated` records whose transaction id was recorded at or before
    /// `created_before`, i.e. payments with no recorded cancellation outcome.
    async fn interrupted(
        &self,
        created_before: DateTime<Utc>,
    ) -> Result<Vec<BountyIssue>, LedgerError>;
}

pub type LedgerHandle = Arc<dyn Ledger>;

pub fn open(config: &LedgerConfig) -> Result<LedgerHandle, LedgerError> {
    match config {
        LedgerConfig::Memory => {
            tracing::warn!("using the in-memory ledger; payout state will not survive a restart");
            Ok(Arc::new(MemoryLedger::new()))
        }
        LedgerConfig::Sqlite { path } => Ok(Arc::new(SqliteLedger::open(path)?)),
    }
}

/// Applies an attempt to `issue`, enforcing forward-only transitions. Shared by
/// both backends so they agree on the state machine.
///
/// Attempts against a settled record only count and log; its status, schedule
/// and failure flag stay as they are.
pub(crate) fn apply_attempt(
    issue: &mut BountyIssue,
    attempt: &AttemptRecord,
) -> Result<PaymentAttemptLogEntry, LedgerError> {
    let settled = issue.status.is_terminal();
    if !settled
        && (issue.status == PayoutStatus::Unpaid
            || !issue.status.can_advance_to(attempt.next_status))
    {
        return Err(LedgerError::InvalidTransition {
            key: issue.key.clone(),
            from: issue.status,
            to: attempt.next_status,
        });
    }

    issue.cancellation_attempts = issue.cancellation_attempts.saturating_add(1);
    issue.last_attempt_at = Some(attempt.attempted_at);
    if !settled {
        issue.status = attempt.next_status;
        issue.next_attempt_at = match attempt.next_status {
            PayoutStatus::CancellationPending => attempt.next_attempt_at,
            _ => None,
        };
        issue.cancellation_failed = attempt.next_status == PayoutStatus::CancellationFailed;
    }

    Ok(PaymentAttemptLogEntry {
        key: issue.key.clone(),
        attempt_number: issue.cancellation_attempts,
        outcome: attempt.outcome,
        timestamp: attempt.attempted_at,
        error_detail: attempt.error_detail.clone(),
    })
}
