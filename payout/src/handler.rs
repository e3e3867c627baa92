use crate::errors::PayoutError;
use crate::gateway::PaymentGateway;
use crate::ledger::{LedgerError, LedgerHandle};
use crate::metrics_defs::{PAYOUT_REQUEST_DURATION, PAYOUT_REQUESTS, SUBSCRIPTIONS_CREATED};
use crate::retry::{CancellationEngine, CancellationOutcome};
use crate::types::{IssueKey, PayoutRequest, Reservation};
use crate::validator::{ValidationError, Validator};
use chrono::Utc;
use shared::{counter, histogram};
use std::sync::Arc;
use std::time::Instant;

/// Result of a payout that moved money.
#[derive(Clone, Debug, PartialEq)]
pub struct PayoutReceipt {
    pub issue_key: IssueKey,
    pub payment_created: bool,
    pub transaction_id: String,
    pub cancellation: CancellationOutcome,
}

/// Runs one payout request end to end: validate, reserve, pay, record, then
/// make the synchronous cancellation attempt.
pub struct PayoutHandler {
    validator: Validator,
    ledger: LedgerHandle,
    gateway: Arc<dyn PaymentGateway>,
    engine: Arc<CancellationEngine>,
}

impl PayoutHandler {
    pub fn new(
        validator: Validator,
        ledger: LedgerHandle,
        gateway: Arc<dyn PaymentGateway>,
        engine: Arc<CancellationEngine>,
    ) -> Self {
        PayoutHandler {
            validator,
            ledger,
            gateway,
            engine,
        }
    }

    pub async fn handle(&self, request: PayoutRequest) -> Result<PayoutReceipt, PayoutError> {
        let start = Instant::now();
        let key = request.issue_key();

        let result = self.process(request).await;

        let outcome = match &result {
            Ok(receipt) => receipt.cancellation.payout_status(),
            Err(err) => err.outcome(),
        };
        counter!(PAYOUT_REQUESTS, "outcome" => outcome).increment(1);
        histogram!(PAYOUT_REQUEST_DURATION, "outcome" => outcome)
            .record(start.elapsed().as_secs_f64());

        match &result {
            Ok(receipt) => tracing::info!(
                issue = %key,
                transaction_id = %receipt.transaction_id,
                outcome,
                "payout completed"
            ),
            Err(PayoutError::Rejected(_)) => {
                tracing::info!(issue = %key, outcome, "payout rejected")
            }
            Err(err) => tracing::warn!(issue = %key, outcome, error = %err, "payout failed"),
        }

        result
    }

    async fn process(&self, request: PayoutRequest) -> Result<PayoutReceipt, PayoutError> {
        let auth = self.validator.validate(&request).await?;
        let key = auth.key.clone();

        // Reserve before any external call. Losing a race here is a duplicate.
        let reservation = Reservation {
            key: key.clone(),
            pull_request_number: auth.pull_request_number,
            assignee_login: auth.assignee_login,
            payee_account_id: auth.payee_account_id.clone(),
            reward_amount: auth.reward_amount,
            created_at: Utc::now(),
        };
        match self.ledger.create_if_absent(reservation).await {
            Ok(_) => {}
            Err(LedgerError::AlreadyExists(_)) => {
                return Err(ValidationError::DuplicatePayment.into());
            }
            Err(err) => return Err(err.into()),
        }

        let transaction_id = match self
            .gateway
            .create_subscription(&auth.payee_account_id, auth.reward_amount)
            .await
        {
            Ok(id) => id,
            Err(err) => {
                if let Err(release_err) = self.ledger.release(&key).await {
                    tracing::error!(
                        issue = %key,
                        error = %release_err,
                        "failed to release reservation after gateway error"
                    );
                }
                return Err(err.into());
            }
        };
        counter!(SUBSCRIPTIONS_CREATED).increment(1);

        let issue = match self.ledger.record_transaction(&key, &transaction_id).await {
            Ok(issue) => issue,
            Err(source) => {
                tracing::error!(
                    issue = %key,
                    transaction_id = %transaction_id,
                    error = %source,
                    "sponsorship created but the ledger write failed"
                );
                if let Err(err) = self.gateway.cancel_subscription(&transaction_id).await {
                    tracing::error!(
                        issue = %key,
                        transaction_id = %transaction_id,
                        error = %err,
                        "direct cancellation of unrecorded sponsorship failed"
                    );
                }
                return Err(PayoutError::LedgerWriteFailed {
                    key,
                    transaction_id,
                    source,
                });
            }
        };

        let cancellation = self.engine.cancel_inline(&issue).await;

        Ok(PayoutReceipt {
            issue_key: key,
            payment_created: true,
            transaction_id,
            cancellation,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Allowlist, RetryPolicy};
    use crate::gateway::{GatewayError, GatewayErrorKind};
    use crate::ledger::MemoryLedger;
    use crate::testutils::{FaultyLedger, MockGateway, MockTracker};
    use crate::tracker::IssueTracker;
    use crate::types::PayoutStatus;
    use std::time::Duration;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 5,
            base_delay_secs: 30,
            max_delay_secs: 1800,
            sync_attempt_timeout_secs: 2,
            poll_interval_secs: 1,
        }
    }

    struct Harness {
        handler: Arc<PayoutHandler>,
        engine: Arc<CancellationEngine>,
        ledger: LedgerHandle,
        gateway: MockGateway,
    }

    fn harness_with(
        tracker: impl IssueTracker + 'static,
        gateway: MockGateway,
        ledger: LedgerHandle,
    ) -> Harness {
        let allowlist = Allowlist::from_entries(&["org/repo"]).unwrap();
        let validator = Validator::new(allowlist, Arc::new(tracker), ledger.clone());
        let gateway_handle: Arc<dyn PaymentGateway> = Arc::new(gateway.clone());
        let engine = Arc::new(CancellationEngine::new(
            ledger.clone(),
            gateway_handle.clone(),
            policy(),
        ));
        let handler = Arc::new(PayoutHandler::new(
            validator,
            ledger.clone(),
            gateway_handle,
            engine.clone(),
        ));
        Harness {
            handler,
            engine,
            ledger,
            gateway,
        }
    }

    fn harness(tracker: MockTracker, gateway: MockGateway) -> Harness {
        harness_with(tracker, gateway, Arc::new(MemoryLedger::new()))
    }

    fn rejection(result: Result<PayoutReceipt, PayoutError>) -> ValidationError {
        match result {
            Err(PayoutError::Rejected(reason)) => reason,
            other => panic!("expected a rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_paid_and_closed() {
        let h = harness(
            MockTracker::bounty("org/repo", 42, "$50"),
            MockGateway::default(),
        );

        let receipt = h
            .handler
            .handle(PayoutRequest::new("org/repo", 42, 456))
            .await
            .unwrap();
        assert_eq!(receipt.cancellation, CancellationOutcome::Succeeded);
        assert_eq!(receipt.cancellation.payout_status(), "paid_and_closed");
        assert!(receipt.payment_created);

        let issue = h
            .ledger
            .get(&IssueKey::new("org/repo", 42))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(issue.status(), PayoutStatus::CancellationSucceeded);
        assert_eq!(issue.cancellation_attempts(), 1);
        assert_eq!(issue.transaction_id(), Some(receipt.transaction_id.as_str()));
        assert_eq!(issue.reward_amount(), 5_000);
        assert_eq!(issue.pull_request_number(), 456);
        assert_eq!(issue.assignee_login(), "octocat");

        assert_eq!(
            h.gateway.created(),
            [("MDQ6VXNlcjE=".to_string(), 5_000)]
        );
        assert_eq!(h.gateway.cancelled(), [receipt.transaction_id]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_duplicate_requests() {
        let h = harness(
            MockTracker::bounty("org/repo", 42, "$50"),
            MockGateway::default().with_create_delay(Duration::from_millis(50)),
        );

        let mut handles = Vec::new();
        for _ in 0..8 {
            let handler = h.handler.clone();
            handles.push(tokio::spawn(async move {
                handler
                    .handle(PayoutRequest::new("org/repo", 42, 456))
                    .await
            }));
        }

        let mut transaction_ids = Vec::new();
        for handle in handles {
            match handle.await.unwrap() {
                Ok(receipt) => transaction_ids.push(receipt.transaction_id),
                Err(err) => assert!(matches!(
                    err,
                    PayoutError::Rejected(ValidationError::DuplicatePayment)
                )),
            }
        }

        assert_eq!(transaction_ids.len(), 1);
        assert_eq!(h.gateway.create_calls(), 1);
    }

    #[tokio::test]
    async fn test_allowlist_enforced_before_side_effects() {
        let h = harness(
            MockTracker::bounty("evil/repo", 1, "$5,000"),
            MockGateway::default(),
        );

        let result = h.handler.handle(PayoutRequest::new("evil/repo", 1, 2)).await;
        assert_eq!(rejection(result), ValidationError::RepositoryNotAllowed);
        assert_eq!(h.gateway.create_calls(), 0);
        assert!(
            h.ledger
                .get(&IssueKey::new("evil/repo", 1))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_no_bounty_label_creates_no_record() {
        let tracker = MockTracker::default().with_issue(
            "org/repo",
            7,
            &["bug"],
            Some(("octocat", Some("MDQ6VXNlcjE="))),
        );
        let h = harness(tracker, MockGateway::default());

        let result = h.handler.handle(PayoutRequest::new("org/repo", 7, 8)).await;
        assert_eq!(rejection(result), ValidationError::NoBountyLabel);
        assert!(
            h.ledger
                .get(&IssueKey::new("org/repo", 7))
                .await
                .unwrap()
                .is_none()
        );
        assert_eq!(h.gateway.create_calls(), 0);
    }

    #[tokio::test]
    async fn test_second_request_after_payment() {
        let h = harness(
            MockTracker::bounty("org/repo", 42, "$50"),
            MockGateway::default(),
        );
        let key = IssueKey::new("org/repo", 42);

        h.handler
            .handle(PayoutRequest::new("org/repo", 42, 456))
            .await
            .unwrap();
        let before = h.ledger.get(&key).await.unwrap().unwrap();

        let result = h
            .handler
            .handle(PayoutRequest::new("Org/Repo", 42, 457))
            .await;
        assert_eq!(rejection(result), ValidationError::DuplicatePayment);

        let after = h.ledger.get(&key).await.unwrap().unwrap();
        assert_eq!(before, after);
        assert_eq!(h.ledger.attempts(&key).await.unwrap().len(), 1);
        assert_eq!(h.gateway.create_calls(), 1);
    }

    #[tokio::test]
    async fn test_always_failing_cancellation() {
        let h = harness(
            MockTracker::bounty("org/repo", 42, "$50"),
            MockGateway::default()
                .fail_cancel_always(GatewayError::new(GatewayErrorKind::Unknown, "upstream 500")),
        );
        let key = IssueKey::new("org/repo", 42);

        let receipt = h
            .handler
            .handle(PayoutRequest::new("org/repo", 42, 456))
            .await
            .unwrap();
        assert_eq!(receipt.cancellation, CancellationOutcome::PendingRetry);
        assert_eq!(
            receipt.cancellation.payout_status(),
            "paid_pending_cancellation"
        );

        let issue = h.ledger.get(&key).await.unwrap().unwrap();
        assert_eq!(issue.status(), PayoutStatus::CancellationPending);
        assert_eq!(issue.cancellation_attempts(), 1);

        let mut now = Utc::now();
        for _ in 0..10 {
            now += chrono::Duration::hours(1);
            h.engine.run_due(now).await.unwrap();
        }

        let issue = h.ledger.get(&key).await.unwrap().unwrap();
        assert_eq!(issue.status(), PayoutStatus::CancellationFailed);
        assert!(issue.cancellation_failed());
        assert_eq!(issue.cancellation_attempts(), policy().max_attempts);
        // Write-once fields survived every attempt
        assert_eq!(issue.transaction_id(), Some(receipt.transaction_id.as_str()));
        assert_eq!(issue.reward_amount(), 5_000);
    }

    #[tokio::test]
    async fn test_non_retryable_cancellation_error() {
        let h = harness(
            MockTracker::bounty("org/repo", 42, "$50"),
            MockGateway::default()
                .fail_cancel_always(GatewayError::new(GatewayErrorKind::Rejected, "forbidden")),
        );

        let receipt = h
            .handler
            .handle(PayoutRequest::new("org/repo", 42, 456))
            .await
            .unwrap();
        assert_eq!(receipt.cancellation, CancellationOutcome::Failed);
        assert_eq!(
            receipt.cancellation.payout_status(),
            "paid_cancellation_failed"
        );

        let issue = h
            .ledger
            .get(&IssueKey::new("org/repo", 42))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(issue.cancellation_attempts(), 1);
        assert!(issue.cancellation_failed());
        assert_eq!(h.gateway.cancel_calls(), 1);
    }

    #[tokio::test]
    async fn test_create_failure_releases_reservation() {
        let h = harness(
            MockTracker::bounty("org/repo", 42, "$50"),
            MockGateway::default()
                .fail_create_once(GatewayError::new(GatewayErrorKind::Timeout, "timed out")),
        );
        let key = IssueKey::new("org/repo", 42);

        let err = h
            .handler
            .handle(PayoutRequest::new("org/repo", 42, 456))
            .await
            .unwrap_err();
        assert!(matches!(err, PayoutError::Gateway(_)));
        assert!(h.ledger.get(&key).await.unwrap().is_none());
        assert_eq!(h.gateway.cancel_calls(), 0);

        // The issue can be paid on a later request
        let receipt = h
            .handler
            .handle(PayoutRequest::new("org/repo", 42, 456))
            .await
            .unwrap();
        assert_eq!(receipt.cancellation, CancellationOutcome::Succeeded);
    }

    #[tokio::test]
    async fn test_tracker_failure() {
        let h = harness(
            MockTracker::bounty("org/repo", 42, "$50").failing(503),
            MockGateway::default(),
        );
        let err = h
            .handler
            .handle(PayoutRequest::new("org/repo", 42, 456))
            .await
            .unwrap_err();
        assert!(matches!(err, PayoutError::Tracker(_)));
        assert_eq!(h.gateway.create_calls(), 0);
    }

    #[tokio::test]
    async fn test_ledger_write_failure_after_payment() {
        let h = harness_with(
            MockTracker::bounty("org/repo", 42, "$50"),
            MockGateway::default(),
            Arc::new(FaultyLedger::default().fail_record_transaction()),
        );
        let key = IssueKey::new("org/repo", 42);

        let err = h
            .handler
            .handle(PayoutRequest::new("org/repo", 42, 456))
            .await
            .unwrap_err();
        let transaction_id = match err {
            PayoutError::LedgerWriteFailed { transaction_id, .. } => transaction_id,
            other => panic!("expected LedgerWriteFailed, got {other:?}"),
        };

        // Best-effort cancellation went out and the reservation still blocks retries
        assert_eq!(h.gateway.cancelled(), [transaction_id]);
        let issue = h.ledger.get(&key).await.unwrap().unwrap();
        assert_eq!(issue.status(), PayoutStatus::Unpaid);
        assert_eq!(issue.transaction_id(), None);

        // Nothing for the background worker or the failed list: the transaction
        // id is only in the error response and the logs
        assert!(h.ledger.list_failed().await.unwrap().is_empty());
        assert!(h.ledger.interrupted(Utc::now()).await.unwrap().is_empty());
        let later = Utc::now() + chrono::Duration::days(1);
        assert_eq!(h.engine.run_due(later).await.unwrap(), 0);

        let result = h
            .handler
            .handle(PayoutRequest::new("org/repo", 42, 456))
            .await;
        assert_eq!(rejection(result), ValidationError::DuplicatePayment);
        assert_eq!(h.gateway.create_calls(), 1);
    }
}
