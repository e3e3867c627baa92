use crate::gateway::{GatewayError, PaymentGateway};
use crate::ledger::{Ledger, LedgerError, MemoryLedger};
use crate::tracker::{Assignee, IssueTracker, TrackedIssue, TrackerError};
use crate::types::{
    AttemptRecord, BountyIssue, IssueKey, PaymentAttemptLogEntry, Reservation,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Default)]
struct GatewayState {
    create_failures: VecDeque<GatewayError>,
    always_fail_create: Option<GatewayError>,
    cancel_failures: VecDeque<GatewayError>,
    always_fail_cancel: Option<GatewayError>,
    fail_cancel_after: Option<(usize, GatewayError)>,
    create_delay: Option<Duration>,
    cancel_delay: Option<Duration>,
    created: Vec<(String, u64)>,
    cancelled: Vec<String>,
}

/// Scripted payment gateway. Clones share state so tests can inspect calls
/// after handing a clone to the code under test.
#[derive(Clone, Default)]
pub struct MockGateway {
    state: Arc<Mutex<GatewayState>>,
    create_calls: Arc<AtomicUsize>,
    cancel_calls: Arc<AtomicUsize>,
    next_id: Arc<AtomicUsize>,
}

impl MockGateway {
    pub fn fail_create(self, err: GatewayError) -> Self {
        self.state.lock().always_fail_create = Some(err);
        self
    }

    pub fn fail_create_once(self, err: GatewayError) -> Self {
        self.state.lock().create_failures.push_back(err);
        self
    }

    pub fn fail_cancel_always(self, err: GatewayError) -> Self {
        self.state.lock().always_fail_cancel = Some(err);
        self
    }

    pub fn fail_cancel_times(self, times: usize, err: GatewayError) -> Self {
        {
            let mut state = self.state.lock();
            for _ in 0..times {
                state.cancel_failures.push_back(err.clone());
            }
        }
        self
    }

    /// The first `successes` cancellations succeed, every later one fails.
    pub fn fail_cancel_after(self, successes: usize, err: GatewayError) -> Self {
        self.state.lock().fail_cancel_after = Some((successes, err));
        self
    }

    pub fn with_create_delay(self, delay: Duration) -> Self {
        self.state.lock().create_delay = Some(delay);
        self
    }

    pub fn with_cancel_delay(self, delay: Duration) -> Self {
        self.state.lock().cancel_delay = Some(delay);
        self
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn cancel_calls(&self) -> usize {
        self.cancel_calls.load(Ordering::SeqCst)
    }

    /// Successful creations as (payee, amount).
    pub fn created(&self) -> Vec<(String, u64)> {
        self.state.lock().created.clone()
    }

    /// Successfully cancelled transaction ids.
    pub fn cancelled(&self) -> Vec<String> {
        self.state.lock().cancelled.clone()
    }
}

#[async_trait]
impl PaymentGateway for MockGateway {
    async fn create_subscription(
        &self,
        payee_account_id: &str,
        amount: u64,
    ) -> Result<String, GatewayError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);

        let delay = self.state.lock().create_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        if let Some(err) = state.always_fail_create.clone() {
            return Err(err);
        }
        if let Some(err) = state.create_failures.pop_front() {
            return Err(err);
        }

        let id = format!("SP_{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        state.created.push((payee_account_id.to_string(), amount));
        Ok(id)
    }

    async fn cancel_subscription(&self, transaction_id: &str) -> Result<(), GatewayError> {
        let call = self.cancel_calls.fetch_add(1, Ordering::SeqCst);

        let delay = self.state.lock().cancel_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        if let Some(err) = state.always_fail_cancel.clone() {
            return Err(err);
        }
        if let Some(err) = state.cancel_failures.pop_front() {
            return Err(err);
        }
        if let Some((successes, err)) = &state.fail_cancel_after
            && call >= *successes
        {
            return Err(err.clone());
        }

        state.cancelled.push(transaction_id.to_string());
        Ok(())
    }
}

/// In-memory issue tracker.
#[derive(Clone, Default)]
pub struct MockTracker {
    issues: Arc<Mutex<HashMap<IssueKey, TrackedIssue>>>,
    fail: Arc<Mutex<Option<u16>>>,
    calls: Arc<AtomicUsize>,
}

impl MockTracker {
    /// A tracker holding one assigned issue with `label`, payable to
    /// `octocat` / `MDQ6VXNlcjE=`.
    pub fn bounty(repository: &str, issue_number: u64, label: &str) -> Self {
        MockTracker::default().with_issue(
            repository,
            issue_number,
            &[label],
            Some(("octocat", Some("MDQ6VXNlcjE="))),
        )
    }

    pub fn with_issue(
        self,
        repository: &str,
        issue_number: u64,
        labels: &[&str],
        assignee: Option<(&str, Option<&str>)>,
    ) -> Self {
        let issue = TrackedIssue {
            labels: labels.iter().map(|l| l.to_string()).collect(),
            assignee: assignee.map(|(login, payee)| Assignee {
                login: login.to_string(),
                payee_account_id: payee.map(str::to_string),
            }),
        };
        self.issues
            .lock()
            .insert(IssueKey::new(repository, issue_number), issue);
        self
    }

    /// Makes every lookup fail with the given upstream status.
    pub fn failing(self, status: u16) -> Self {
        *self.fail.lock() = Some(status);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IssueTracker for MockTracker {
    async fn issue(&self, key: &IssueKey) -> Result<Option<TrackedIssue>, TrackerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(status) = *self.fail.lock() {
            let status = reqwest::StatusCode::from_u16(status)
                .unwrap_or(reqwest::StatusCode::BAD_GATEWAY);
            return Err(TrackerError::Status(status));
        }
        Ok(self.issues.lock().get(key).cloned())
    }
}

/// Memory ledger with injectable write failures.
#[derive(Default)]
pub struct FaultyLedger {
    inner: MemoryLedger,
    fail_record_transaction: AtomicBool,
    append_failures: AtomicUsize,
}

impl FaultyLedger {
    pub fn fail_record_transaction(self) -> Self {
        self.fail_record_transaction.store(true, Ordering::SeqCst);
        self
    }

    pub fn fail_append_times(self, times: usize) -> Self {
        self.append_failures.store(times, Ordering::SeqCst);
        self
    }
}

#[async_trait]
impl Ledger for FaultyLedger {
    async fn get(&self, key: &IssueKey) -> Result<Option<BountyIssue>, LedgerError> {
        self.inner.get(key).await
    }

    async fn create_if_absent(&self, reservation: Reservation) -> Result<BountyIssue, LedgerError> {
        self.inner.create_if_absent(reservation).await
    }

    async fn release(&self, key: &IssueKey) -> Result<(), LedgerError> {
        self.inner.release(key).await
    }

    async fn record_transaction(
        &self,
        key: &IssueKey,
        transaction_id: &str,
    ) -> Result<BountyIssue, LedgerError> {
        if self.fail_record_transaction.load(Ordering::SeqCst) {
            return Err(LedgerError::storage("record_transaction", "disk I/O error"));
        }
        self.inner.record_transaction(key, transaction_id).await
    }

    async fn append_attempt(
        &self,
        key: &IssueKey,
        attempt: AttemptRecord,
    ) -> Result<BountyIssue, LedgerError> {
        let fail = self
            .append_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(LedgerError::storage("append_attempt", "database is locked"));
        }
        self.inner.append_attempt(key, attempt).await
    }

    async fn attempts(&self, key: &IssueKey) -> Result<Vec<PaymentAttemptLogEntry>, LedgerError> {
        self.inner.attempts(key).await
    }

    async fn list_failed(&self) -> Result<Vec<BountyIssue>, LedgerError> {
        self.inner.list_failed().await
    }

    async fn due_for_retry(&self, now: DateTime<Utc>) -> Result<Vec<BountyIssue>, LedgerError> {
        self.inner.due_for_retry(now).await
    }

    async fn interrupted(
        &self,
        created_before: DateTime<Utc>,
    ) -> Result<Vec<BountyIssue>, LedgerError> {
        self.inner.interrupted(created_before).await
    }
}
