use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifies one payout: a repository and an issue number within it.
///
/// Repository names are compared case-insensitively by the issue tracker, so
/// the key stores them lowercased.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct IssueKey {
    pub repository: String,
    pub issue_number: u64,
}

impl IssueKey {
    pub fn new(repository: &str, issue_number: u64) -> Self {
        IssueKey {
            repository: repository.trim().to_ascii_lowercase(),
            issue_number,
        }
    }
}

impl fmt::Display for IssueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.repository, self.issue_number)
    }
}

/// Inbound request from the merge trigger. Not persisted.
#[derive(Clone, Debug, Deserialize)]
pub struct PayoutRequest {
    pub repository: String,
    pub issue_number: u64,
    pub pull_request_number: u64,
    #[serde(default = "Utc::now")]
    pub requested_at: DateTime<Utc>,
}

impl PayoutRequest {
    pub fn new(repository: &str, issue_number: u64, pull_request_number: u64) -> Self {
        PayoutRequest {
            repository: repository.to_string(),
            issue_number,
            pull_request_number,
            requested_at: Utc::now(),
        }
    }

    pub fn issue_key(&self) -> IssueKey {
        IssueKey::new(&self.repository, self.issue_number)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PayoutStatus {
    Unpaid,
    PaymentCreated,
    CancellationPending,
    CancellationSucceeded,
    CancellationFailed,
}

impl PayoutStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            PayoutStatus::Unpaid => "Unpaid",
            PayoutStatus::PaymentCreated => "PaymentCreated",
            PayoutStatus::CancellationPending => "CancellationPending",
            PayoutStatus::CancellationSucceeded => "CancellationSucceeded",
            PayoutStatus::CancellationFailed => "CancellationFailed",
        }
    }

    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            PayoutStatus::CancellationSucceeded | PayoutStatus::CancellationFailed
        )
    }

    /// Whether money has moved for a record in this status.
    pub const fn is_paid(&self) -> bool {
        !matches!(self, PayoutStatus::Unpaid)
    }

    /// Forward-only transition table. `CancellationPending` may be re-entered
    /// after each failed background attempt.
    pub fn can_advance_to(&self, next: PayoutStatus) -> bool {
        use PayoutStatus::*;

        match (self, next) {
            (Unpaid, PaymentCreated) => true,
            (PaymentCreated | CancellationPending, CancellationPending) => true,
            (PaymentCreated | CancellationPending, CancellationSucceeded) => true,
            (PaymentCreated | CancellationPending, CancellationFailed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for PayoutStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(thiserror::Error, Debug, PartialEq)]
#[error("unknown payout status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for PayoutStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Unpaid" => Ok(PayoutStatus::Unpaid),
            "PaymentCreated" => Ok(PayoutStatus::PaymentCreated),
            "CancellationPending" => Ok(PayoutStatus::CancellationPending),
            "CancellationSucceeded" => Ok(PayoutStatus::CancellationSucceeded),
            "CancellationFailed" => Ok(PayoutStatus::CancellationFailed),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// Fields captured when a payout is reserved, before any external call.
#[derive(Clone, Debug, PartialEq)]
pub struct Reservation {
    pub key: IssueKey,
    pub pull_request_number: u64,
    pub assignee_login: String,
    pub payee_account_id: String,
    pub reward_amount: u64,
    pub created_at: DateTime<Utc>,
}

/// The durable payout record for one issue.
///
/// Fields are private: `reward_amount` and `transaction_id` can only be set by
/// the ledger, once, and nothing outside this crate can construct or mutate a
/// record.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BountyIssue {
    #[serde(flatten)]
    pub(crate) key: IssueKey,
    pub(crate) pull_request_number: u64,
    pub(crate) assignee_login: String,
    pub(crate) payee_account_id: String,
    pub(crate) reward_amount: u64,
    pub(crate) transaction_id: Option<String>,
    /// When the transaction id was recorded
    pub(crate) payment_created_at: Option<DateTime<Utc>>,
    pub(crate) status: PayoutStatus,
    pub(crate) cancellation_attempts: u32,
    pub(crate) last_attempt_at: Option<DateTime<Utc>>,
    pub(crate) next_attempt_at: Option<DateTime<Utc>>,
    pub(crate) cancellation_failed: bool,
    pub(crate) created_at: DateTime<Utc>,
}

impl BountyIssue {
    pub(crate) fn reserved(reservation: Reservation) -> Self {
        BountyIssue {
            key: reservation.key,
            pull_request_number: reservation.pull_request_number,
            assignee_login: reservation.assignee_login,
            payee_account_id: reservation.payee_account_id,
            reward_amount: reservation.reward_amount,
            transaction_id: None,
            payment_created_at: None,
            status: PayoutStatus::Unpaid,
            cancellation_attempts: 0,
            last_attempt_at: None,
            next_attempt_at: None,
            cancellation_failed: false,
            created_at: reservation.created_at,
        }
    }

    pub fn key(&self) -> &IssueKey {
        &self.key
    }

    pub fn pull_request_number(&self) -> u64 {
        self.pull_request_number
    }

    pub fn assignee_login(&self) -> &str {
        &self.assignee_login
    }

    pub fn payee_account_id(&self) -> &str {
        &self.payee_account_id
    }

    pub fn reward_amount(&self) -> u64 {
        self.reward_amount
    }

    pub fn transaction_id(&self) -> Option<&str> {
        self.transaction_id.as_deref()
    }

    pub fn payment_created_at(&self) -> Option<DateTime<Utc>> {
        self.payment_created_at
    }

    pub fn status(&self) -> PayoutStatus {
        self.status
    }

    pub fn cancellation_attempts(&self) -> u32 {
        self.cancellation_attempts
    }

    pub fn last_attempt_at(&self) -> Option<DateTime<Utc>> {
        self.last_attempt_at
    }

    pub fn next_attempt_at(&self) -> Option<DateTime<Utc>> {
        self.next_attempt_at
    }

    pub fn cancellation_failed(&self) -> bool {
        self.cancellation_failed
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Succeeded,
    Failed,
}

impl AttemptOutcome {
    pub const fn as_str(&self) -> &'static str {
        match self {
            AttemptOutcome::Succeeded => "succeeded",
            AttemptOutcome::Failed => "failed",
        }
    }
}

impl FromStr for AttemptOutcome {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "succeeded" => Ok(AttemptOutcome::Succeeded),
            "failed" => Ok(AttemptOutcome::Failed),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// One cancellation attempt that already happened, plus the state the retry
/// engine decided the record moves to because of it.
#[derive(Clone, Debug, PartialEq)]
pub struct AttemptRecord {
    pub outcome: AttemptOutcome,
    pub error_detail: Option<String>,
    pub attempted_at: DateTime<Utc>,
    pub next_status: PayoutStatus,
    pub next_attempt_at: Option<DateTime<Utc>>,
}

/// Append-only audit entry.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PaymentAttemptLogEntry {
    #[serde(flatten)]
    pub key: IssueKey,
    pub attempt_number: u32,
    pub outcome: AttemptOutcome,
    pub timestamp: DateTime<Utc>,
    pub error_detail: Option<String>,
}
