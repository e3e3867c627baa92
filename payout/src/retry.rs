//! Cancellation of created sponsorships.
//!
//! `CancellationEngine` decides what each attempt means for the payout record
//! and writes that decision to the ledger. `RetryWorker` drives the background
//! attempts. All scheduling state (`next_attempt_at`, attempt counts) lives in
//! the ledger, so a restarted worker picks up where the previous one stopped.
//!
//! A `PaymentCreated` record may have its synchronous attempt in flight. The
//! worker only touches such records once `RetryPolicy::interrupted_after` has
//! passed since the payment was recorded.

use crate::config::RetryPolicy;
use crate::gateway::{GatewayError, GatewayErrorKind, PaymentGateway};
use crate::ledger::{LedgerError, LedgerHandle};
use crate::metrics_defs::{CANCELLATION_ATTEMPTS, CANCELLATIONS_FAILED, PENDING_CANCELLATIONS};
use crate::types::{AttemptOutcome, AttemptRecord, BountyIssue, PayoutStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use shared::{counter, gauge};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancellationOutcome {
    Succeeded,
    PendingRetry,
    Failed,
}

impl CancellationOutcome {
    fn from_status(status: PayoutStatus) -> Self {
        match status {
            PayoutStatus::CancellationSucceeded => CancellationOutcome::Succeeded,
            PayoutStatus::CancellationFailed => CancellationOutcome::Failed,
            _ => CancellationOutcome::PendingRetry,
        }
    }

    /// Payout status reported to the caller of the payout API.
    pub const fn payout_status(&self) -> &'static str {
        match self {
            CancellationOutcome::Succeeded => "paid_and_closed",
            CancellationOutcome::PendingRetry => "paid_pending_cancellation",
            CancellationOutcome::Failed => "paid_cancellation_failed",
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum AttemptPath {
    Sync,
    Background,
}

impl AttemptPath {
    const fn as_str(&self) -> &'static str {
        match self {
            AttemptPath::Sync => "sync",
            AttemptPath::Background => "background",
        }
    }
}

pub struct CancellationEngine {
    ledger: LedgerHandle,
    gateway: Arc<dyn PaymentGateway>,
    policy: RetryPolicy,
}

impl CancellationEngine {
    pub fn new(ledger: LedgerHandle, gateway: Arc<dyn PaymentGateway>, policy: RetryPolicy) -> Self {
        CancellationEngine {
            ledger,
            gateway,
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Maps the result of attempt number `attempt_number` (1-based) to the
    /// record's next state.
    pub fn decide(
        &self,
        attempt_number: u32,
        result: Result<(), &GatewayError>,
        now: DateTime<Utc>,
    ) -> AttemptRecord {
        let err = match result {
            Ok(()) => {
                return AttemptRecord {
                    outcome: AttemptOutcome::Succeeded,
                    error_detail: None,
                    attempted_at: now,
                    next_status: PayoutStatus::CancellationSucceeded,
                    next_attempt_at: None,
                };
            }
            Err(err) => err,
        };

        let (next_status, next_attempt_at) =
            if !err.is_retryable() || attempt_number >= self.policy.max_attempts {
                (PayoutStatus::CancellationFailed, None)
            } else {
                let delay = self.policy.delay_after(attempt_number);
                let next = chrono::Duration::from_std(delay)
                    .ok()
                    .and_then(|delay| now.checked_add_signed(delay))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC);
                (PayoutStatus::CancellationPending, Some(next))
            };

        AttemptRecord {
            outcome: AttemptOutcome::Failed,
            error_detail: Some(err.to_string()),
            attempted_at: now,
            next_status,
            next_attempt_at,
        }
    }

    /// The single attempt made while the payout request is still open, bounded
    /// by `sync_attempt_timeout`. An elapsed timeout counts as a retryable
    /// failure.
    pub async fn cancel_inline(&self, issue: &BountyIssue) -> CancellationOutcome {
        let Some(transaction_id) = issue.transaction_id() else {
            return self.record_missing_transaction(issue).await;
        };

        let timeout = self.policy.sync_attempt_timeout();
        let result = match tokio::time::timeout(
            timeout,
            self.gateway.cancel_subscription(transaction_id),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(GatewayError::timeout(format!(
                "cancellation did not finish within {}s",
                timeout.as_secs()
            ))),
        };

        self.record(issue, result, AttemptPath::Sync).await
    }

    /// One background attempt for a record in `PaymentCreated` or
    /// `CancellationPending`.
    pub async fn attempt(&self, issue: &BountyIssue) -> CancellationOutcome {
        let Some(transaction_id) = issue.transaction_id() else {
            return self.record_missing_transaction(issue).await;
        };

        let result = self.gateway.cancel_subscription(transaction_id).await;
        self.record(issue, result, AttemptPath::Background).await
    }

    /// Attempts every pending cancellation due at `now`, plus payments whose
    /// synchronous attempt went unrecorded for longer than `interrupted_after`.
    /// Returns how many were attempted.
    pub async fn run_due(&self, now: DateTime<Utc>) -> Result<usize, LedgerError> {
        let mut due = self.ledger.due_for_retry(now).await?;
        let cutoff = earlier(now, self.policy.interrupted_after());
        due.extend(self.ledger.interrupted(cutoff).await?);
        gauge!(PENDING_CANCELLATIONS).set(due.len() as f64);

        for issue in &due {
            self.attempt(issue).await;
        }
        Ok(due.len())
    }

    /// Attempts cancellation for every payment whose outcome was never
    /// recorded, e.g. after a crash between creation and the synchronous
    /// attempt. Must finish before the payout API accepts requests.
    pub async fn resume_interrupted(&self) -> Result<usize, LedgerError> {
        let interrupted = self.ledger.interrupted(Utc::now()).await?;
        for issue in &interrupted {
            tracing::warn!(
                issue = %issue.key(),
                transaction_id = issue.transaction_id(),
                "resuming cancellation of interrupted payout"
            );
            self.attempt(issue).await;
        }
        Ok(interrupted.len())
    }

    async fn record_missing_transaction(&self, issue: &BountyIssue) -> CancellationOutcome {
        let err = GatewayError::new(
            GatewayErrorKind::Rejected,
            "payout record has no transaction id to cancel",
        );
        self.record(issue, Err(err), AttemptPath::Background).await
    }

    async fn record(
        &self,
        issue: &BountyIssue,
        result: Result<(), GatewayError>,
        path: AttemptPath,
    ) -> CancellationOutcome {
        let attempt_number = issue.cancellation_attempts().saturating_add(1);
        let record = self.decide(attempt_number, result.as_ref().map(|_| ()), Utc::now());

        counter!(
            CANCELLATION_ATTEMPTS,
            "outcome" => record.outcome.as_str(),
            "path" => path.as_str()
        )
        .increment(1);

        let next_status = record.next_status;
        let updated = match self.ledger.append_attempt(issue.key(), record).await {
            Ok(updated) => updated,
            Err(err) => {
                // The record keeps its previous status and is picked up again by
                // the worker's periodic pass
                tracing::error!(
                    issue = %issue.key(),
                    transaction_id = issue.transaction_id(),
                    attempted_status = %next_status,
                    error = %err,
                    "failed to record cancellation attempt"
                );
                return CancellationOutcome::PendingRetry;
            }
        };

        if updated.status() != next_status {
            tracing::warn!(
                issue = %updated.key(),
                transaction_id = updated.transaction_id(),
                attempted_status = %next_status,
                status = %updated.status(),
                attempts = updated.cancellation_attempts(),
                "cancellation attempt logged against an already settled payout"
            );
            return CancellationOutcome::from_status(updated.status());
        }

        match updated.status() {
            PayoutStatus::CancellationSucceeded => {
                tracing::info!(
                    issue = %updated.key(),
                    transaction_id = updated.transaction_id(),
                    attempts = updated.cancellation_attempts(),
                    "sponsorship cancelled"
                );
            }
            PayoutStatus::CancellationPending => {
                tracing::warn!(
                    issue = %updated.key(),
                    transaction_id = updated.transaction_id(),
                    attempts = updated.cancellation_attempts(),
                    next_attempt_at = ?updated.next_attempt_at(),
                    error = ?result.as_ref().err(),
                    "cancellation failed; retry scheduled"
                );
            }
            PayoutStatus::CancellationFailed => {
                counter!(CANCELLATIONS_FAILED).increment(1);
                tracing::error!(
                    issue = %updated.key(),
                    transaction_id = updated.transaction_id(),
                    payee_account_id = updated.payee_account_id(),
                    attempts = updated.cancellation_attempts(),
                    error = ?result.as_ref().err(),
                    "cancellation permanently failed; sponsorship may still be active and needs manual action"
                );
            }
            _ => {}
        }

        CancellationOutcome::from_status(updated.status())
    }
}

fn earlier(now: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(by)
        .ok()
        .and_then(|by| now.checked_sub_signed(by))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

struct WorkerInner {
    shutdown: parking_lot::Mutex<Option<oneshot::Sender<()>>>,
    running: Arc<AtomicBool>,
    handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

/// Background task that retries due cancellations on a fixed poll interval.
#[derive(Clone)]
pub struct RetryWorker {
    inner: Arc<WorkerInner>,
}

impl RetryWorker {
    pub fn spawn(engine: Arc<CancellationEngine>) -> Self {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let running = Arc::new(AtomicBool::new(true));

        let running_clone = running.clone();
        let handle = tokio::spawn(async move {
            Self::run(engine, shutdown_rx).await;
            running_clone.store(false, Ordering::Relaxed);
        });

        RetryWorker {
            inner: Arc::new(WorkerInner {
                shutdown: parking_lot::Mutex::new(Some(shutdown_tx)),
                running,
                handle: parking_lot::Mutex::new(Some(handle)),
            }),
        }
    }

    async fn run(engine: Arc<CancellationEngine>, mut shutdown: oneshot::Receiver<()>) {
        let mut interval = tokio::time::interval(engine.policy().poll_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = &mut shutdown => {
                    tracing::info!("retry worker shutting down");
                    return;
                }
            }

            match engine.run_due(Utc::now()).await {
                Ok(0) => {}
                Ok(count) => tracing::debug!(count, "processed due cancellations"),
                Err(err) => tracing::error!(error = %err, "failed to load due cancellations"),
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Relaxed)
    }

    /// Stops the worker and waits for the current pass to finish.
    pub async fn shutdown(&self) {
        let shutdown = self.inner.shutdown.lock().take();
        if let Some(shutdown) = shutdown {
            // Err means the task already exited
            let _ = shutdown.send(());
        }
        let handle = self.inner.handle.lock().take();
        if let Some(handle) = handle
            && let Err(err) = handle.await
        {
            tracing::error!(error = %err, "retry worker task failed");
        }
    }
}
