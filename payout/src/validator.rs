use crate::config::Allowlist;
use crate::errors::PayoutError;
use crate::label::reward_from_labels;
use crate::ledger::LedgerHandle;
use crate::tracker::IssueTracker;
use crate::types::{IssueKey, PayoutRequest};
use std::sync::Arc;
use thiserror::Error;

/// Reasons a payout request is refused before any side effect.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationError {
    #[error("repository is not on the allowlist")]
    RepositoryNotAllowed,

    #[error("issue does not exist")]
    IssueNotFound,

    #[error("issue has no bounty label")]
    NoBountyLabel,

    #[error("assignee has no linked payee account")]
    NoLinkedPayee,

    #[error("issue has already been paid")]
    DuplicatePayment,
}

impl ValidationError {
    /// Stable reason code reported to callers.
    pub const fn reason(&self) -> &'static str {
        match self {
            ValidationError::RepositoryNotAllowed => "RepositoryNotAllowed",
            ValidationError::IssueNotFound => "IssueNotFound",
            ValidationError::NoBountyLabel => "NoBountyLabel",
            ValidationError::NoLinkedPayee => "NoLinkedPayee",
            ValidationError::DuplicatePayment => "DuplicatePayment",
        }
    }
}

/// Everything the handler needs to move money for one issue.
#[derive(Clone, Debug, PartialEq)]
pub struct Authorization {
    pub key: IssueKey,
    pub pull_request_number: u64,
    pub reward_amount: u64,
    pub payee_account_id: String,
    pub assignee_login: String,
}

pub struct Validator {
    allowlist: Allowlist,
    tracker: Arc<dyn IssueTracker>,
    ledger: LedgerHandle,
}

impl Validator {
    pub fn new(allowlist: Allowlist, tracker: Arc<dyn IssueTracker>, ledger: LedgerHandle) -> Self {
        Validator {
            allowlist,
            tracker,
            ledger,
        }
    }

    /// Runs the checks in order and stops at the first failure. Nothing here
    /// mutates state; the duplicate check is advisory and the ledger reservation
    /// is what actually serializes concurrent requests.
    pub async fn validate(&self, request: &PayoutRequest) -> Result<Authorization, PayoutError> {
        let key = request.issue_key();

        if !self.allowlist.contains(&key.repository) {
            return Err(ValidationError::RepositoryNotAllowed.into());
        }

        let issue = self
            .tracker
            .issue(&key)
            .await?
            .ok_or(ValidationError::IssueNotFound)?;

        let reward_amount =
            reward_from_labels(&issue.labels).ok_or(ValidationError::NoBountyLabel)?;

        let (assignee_login, payee_account_id) = issue
            .assignee
            .and_then(|a| a.payee_account_id.map(|id| (a.login, id)))
            .ok_or(ValidationError::NoLinkedPayee)?;

        if let Some(existing) = self.ledger.get(&key).await?
            && (existing.transaction_id().is_some() || existing.status().is_paid())
        {
            return Err(ValidationError::DuplicatePayment.into());
        }

        Ok(Authorization {
            key,
            pull_request_number: request.pull_request_number,
            reward_amount,
            payee_account_id,
            assignee_login,
        })
    }
}
