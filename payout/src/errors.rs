use crate::gateway::GatewayError;
use crate::ledger::LedgerError;
use crate::tracker::TrackerError;
use crate::types::IssueKey;
use crate::validator::ValidationError;
use http::StatusCode;
use serde_json::{Value, json};
use thiserror::Error;

/// Errors returned by the payout request path.
#[derive(Error, Debug)]
pub enum PayoutError {
    #[error("payout rejected: {0}")]
    Rejected(#[from] ValidationError),

    #[error("payment gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("issue tracker error: {0}")]
    Tracker(#[from] TrackerError),

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// Money moved but the ledger never learned the transaction id.
    #[error("payment {transaction_id} for {key} was created but could not be recorded: {source}")]
    LedgerWriteFailed {
        key: IssueKey,
        transaction_id: String,
        source: LedgerError,
    },
}

impl PayoutError {
    /// Short outcome tag used in logs and metrics.
    pub fn outcome(&self) -> &'static str {
        match self {
            PayoutError::Rejected(reason) => reason.reason(),
            PayoutError::Gateway(_) => "GatewayError",
            PayoutError::Tracker(_) => "TrackerError",
            PayoutError::Ledger(_) => "LedgerError",
            PayoutError::LedgerWriteFailed { .. } => "LedgerWriteFailed",
        }
    }

    /// HTTP status and JSON body reported to the caller.
    pub fn response_parts(&self) -> (StatusCode, Value) {
        match self {
            PayoutError::Rejected(reason) => {
                let status = match reason {
                    ValidationError::RepositoryNotAllowed => StatusCode::FORBIDDEN,
                    ValidationError::IssueNotFound => StatusCode::NOT_FOUND,
                    ValidationError::NoBountyLabel | ValidationError::NoLinkedPayee => {
                        StatusCode::UNPROCESSABLE_ENTITY
                    }
                    ValidationError::DuplicatePayment => StatusCode::CONFLICT,
                };
                (
                    status,
                    json!({"status": "rejected", "reason": reason.reason()}),
                )
            }
            PayoutError::Gateway(err) => (
                StatusCode::BAD_GATEWAY,
                json!({
                    "status": "error",
                    "reason": "GatewayError",
                    "detail": err.to_string(),
                }),
            ),
            PayoutError::Tracker(err) => (
                StatusCode::BAD_GATEWAY,
                json!({
                    "status": "error",
                    "reason": "TrackerError",
                    "detail": err.to_string(),
                }),
            ),
            PayoutError::Ledger(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({"status": "error", "reason": "LedgerError"}),
            ),
            PayoutError::LedgerWriteFailed { transaction_id, .. } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({
                    "status": "error",
                    "reason": "LedgerWriteFailed",
                    "transaction_id": transaction_id,
                }),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::GatewayErrorKind;

    #[test]
    fn test_rejection_statuses() {
        let cases = [
            (ValidationError::RepositoryNotAllowed, StatusCode::FORBIDDEN),
            (ValidationError::NoBountyLabel, StatusCode::UNPROCESSABLE_ENTITY),
            (ValidationError::NoLinkedPayee, StatusCode::UNPROCESSABLE_ENTITY),
            (ValidationError::DuplicatePayment, StatusCode::CONFLICT),
            (ValidationError::IssueNotFound, StatusCode::NOT_FOUND),
        ];

        for (reason, expected) in cases {
            let (status, body) = PayoutError::from(reason).response_parts();
            assert_eq!(status, expected);
            assert_eq!(body["status"], "rejected");
            assert_eq!(body["reason"], reason.reason());
        }
    }

    #[test]
    fn test_error_bodies() {
        let err = PayoutError::from(GatewayError::new(GatewayErrorKind::Rejected, "denied"));
        let (status, body) = err.response_parts();
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["reason"], "GatewayError");
        assert_eq!(body["detail"], "rejected: denied");

        let err = PayoutError::LedgerWriteFailed {
            key: IssueKey::new("org/repo", 1),
            transaction_id: "SP_1".into(),
            source: LedgerError::storage("record_transaction", "disk full"),
        };
        let (status, body) = err.response_parts();
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["reason"], "LedgerWriteFailed");
        assert_eq!(body["transaction_id"], "SP_1");
        assert_eq!(err.outcome(), "LedgerWriteFailed");
    }
}
