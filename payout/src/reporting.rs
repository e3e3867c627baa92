use crate::ledger::{LedgerError, LedgerHandle};
use crate::types::{BountyIssue, IssueKey, PaymentAttemptLogEntry};
use serde::Serialize;

/// A payout record with its full attempt history.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct IssueHistory {
    pub issue: BountyIssue,
    pub attempts: Vec<PaymentAttemptLogEntry>,
}

/// Read-only view over the ledger for operators.
#[derive(Clone)]
pub struct Reporting {
    ledger: LedgerHandle,
}

impl Reporting {
    pub fn new(ledger: LedgerHandle) -> Self {
        Reporting { ledger }
    }

    /// Payouts whose sponsorship may still be active and need manual action.
    pub async fn failed_payouts(&self) -> Result<Vec<BountyIssue>, LedgerError> {
        self.ledger.list_failed().await
    }

    pub async fn history(&self, key: &IssueKey) -> Result<Option<IssueHistory>, LedgerError> {
        let Some(issue) = self.ledger.get(key).await? else {
            return Ok(None);
        };
        let attempts = self.ledger.attempts(key).await?;
        Ok(Some(IssueHistory { issue, attempts }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedger;
    use crate::ledger::tests::{failed_attempt, reservation};
    use crate::types::PayoutStatus;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_reporting() {
        let ledger: LedgerHandle = Arc::new(MemoryLedger::new());
        let reporting = Reporting::new(ledger.clone());
        let key = IssueKey::new("org/repo", 42);

        assert!(reporting.history(&key).await.unwrap().is_none());
        assert!(reporting.failed_payouts().await.unwrap().is_empty());

        ledger
            .create_if_absent(reservation("org/repo", 42))
            .await
            .unwrap();
        ledger.record_transaction(&key, "SP_1").await.unwrap();
        ledger
            .append_attempt(&key, failed_attempt(PayoutStatus::CancellationFailed, None))
            .await
            .unwrap();

        let failed = reporting.failed_payouts().await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].transaction_id(), Some("SP_1"));

        let history = reporting.history(&key).await.unwrap().unwrap();
        assert_eq!(history.issue.status(), PayoutStatus::CancellationFailed);
        assert_eq!(history.attempts.len(), 1);

        let json = serde_json::to_value(&history).unwrap();
        assert_eq!(json["issue"]["repository"], "org/repo");
        assert_eq!(json["issue"]["status"], "CancellationFailed");
        assert_eq!(json["attempts"][0]["attempt_number"], 1);
        assert_eq!(json["attempts"][0]["outcome"], "failed");
    }
}
