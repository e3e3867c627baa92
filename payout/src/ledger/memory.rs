use super::{Ledger, LedgerError, apply_attempt};
use crate::types::{
    AttemptRecord, BountyIssue, IssueKey, PaymentAttemptLogEntry, PayoutStatus, Reservation,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;

struct Entry {
    issue: BountyIssue,
    attempts: Vec<PaymentAttemptLogEntry>,
}

/// Process-local ledger. Every operation runs under one mutex, which makes
/// `create_if_absent` a single conditional insert.
#[derive(Default)]
pub struct MemoryLedger {
    entries: Mutex<HashMap<IssueKey, Entry>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn select<P>(&self, predicate: P) -> Vec<BountyIssue>
    where
        P: Fn(&BountyIssue) -> bool,
    {
        let entries = self.entries.lock();
        let mut issues: Vec<BountyIssue> = entries
            .values()
            .map(|entry| &entry.issue)
            .filter(|issue| predicate(issue))
            .cloned()
            .collect();
        issues.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.key.cmp(&b.key)));
        issues
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn get(&self, key: &IssueKey) -> Result<Option<BountyIssue>, LedgerError> {
        Ok(self.entries.lock().get(key).map(|entry| entry.issue.clone()))
    }

    async fn create_if_absent(&self, reservation: Reservation) -> Result<BountyIssue, LedgerError> {
        let mut entries = self.entries.lock();
        if entries.contains_key(&reservation.key) {
            return Err(LedgerError::AlreadyExists(reservation.key));
        }

        let issue = BountyIssue::reserved(reservation);
        entries.insert(
            issue.key.clone(),
            Entry {
                issue: issue.clone(),
                attempts: Vec::new(),
            },
        );
        Ok(issue)
    }

    async fn release(&self, key: &IssueKey) -> Result<(), LedgerError> {
        let mut entries = self.entries.lock();
        let entry = entries
            .get(key)
            .ok_or_else(|| LedgerError::NotFound(key.clone()))?;

        if entry.issue.status != PayoutStatus::Unpaid || entry.issue.transaction_id.is_some() {
            return Err(LedgerError::ReleaseRefused(key.clone()));
        }

        entries.remove(key);
        Ok(())
    }

    async fn record_transaction(
        &self,
        key: &IssueKey,
        transaction_id: &str,
    ) -> Result<BountyIssue, LedgerError> {
        let mut entries = self.entries.lock();
        let entry = entries
            .get_mut(key)
            .ok_or_else(|| LedgerError::NotFound(key.clone()))?;

        if entry.issue.transaction_id.is_some() || entry.issue.status != PayoutStatus::Unpaid {
            return Err(LedgerError::TransactionAlreadyRecorded(key.clone()));
        }

        entry.issue.transaction_id = Some(transaction_id.to_string());
        entry.issue.payment_created_at = Some(Utc::now());
        entry.issue.status = PayoutStatus::PaymentCreated;
        Ok(entry.issue.clone())
    }

    async fn append_attempt(
        &self,
        key: &IssueKey,
        attempt: AttemptRecord,
    ) -> Result<BountyIssue, LedgerError> {
        let mut entries = self.entries.lock();
        let entry = entries
            .get_mut(key)
            .ok_or_else(|| LedgerError::NotFound(key.clone()))?;

        // Work on a copy so a rejected transition leaves the entry untouched
        let mut issue = entry.issue.clone();
        let log_entry = apply_attempt(&mut issue, &attempt)?;

        entry.issue = issue;
        entry.attempts.push(log_entry);
        Ok(entry.issue.clone())
    }

    async fn attempts(&self, key: &IssueKey) -> Result<Vec<PaymentAttemptLogEntry>, LedgerError> {
        Ok(self
            .entries
            .lock()
            .get(key)
            .map(|entry| entry.attempts.clone())
            .unwrap_or_default())
    }

    async fn list_failed(&self) -> Result<Vec<BountyIssue>, LedgerError> {
        Ok(self.select(|issue| issue.cancellation_failed))
    }

    async fn due_for_retry(&self, now: DateTime<Utc>) -> Result<Vec<BountyIssue>, LedgerError> {
        Ok(self.select(|issue| {
            issue.status == PayoutStatus::CancellationPending
                && issue.next_attempt_at.is_none_or(|at| at <= now)
        }))
    }

    async fn interrupted(
        &self,
        created_before: DateTime<Utc>,
    ) -> Result<Vec<BountyIssue>, LedgerError> {
        Ok(self.select(|issue| {
            issue.status == PayoutStatus::PaymentCreated
                && issue
                    .payment_created_at
                    .is_none_or(|at| at <= created_before)
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::tests::{exercise_ledger, reservation};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_memory_ledger() {
        exercise_ledger(&MemoryLedger::new()).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_reservations() {
        let ledger = Arc::new(MemoryLedger::new());

        let mut handles = Vec::new();
        for _ in 0..16 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                ledger.create_if_absent(reservation("org/repo", 1)).await
            }));
        }

        let mut created = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => created += 1,
                Err(LedgerError::AlreadyExists(_)) => {}
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(created, 1);
    }
}
