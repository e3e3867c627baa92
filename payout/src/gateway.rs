//! Sponsorship platform client. A payment is a sponsorship that is cancelled
//! right after creation. The client makes single calls and never retries.

use crate::config::SponsorsConfig;
use crate::graphql::{self, GraphqlError, GraphqlFailure};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use std::fmt;
use std::time::Duration;
use url::Url;

const CREATE_SPONSORSHIP: &str = "mutation($input: CreateSponsorshipInput!) {
  createSponsorship(input: $input) { sponsorship { id } }
}";

const CANCEL_SPONSORSHIP: &str = "mutation($input: CancelSponsorshipInput!) {
  cancelSponsorship(input: $input) { clientMutationId }
}";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GatewayErrorKind {
    Timeout,
    RateLimited,
    Rejected,
    Unknown,
}

impl GatewayErrorKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            GatewayErrorKind::Timeout => "timeout",
            GatewayErrorKind::RateLimited => "rate_limited",
            GatewayErrorKind::Rejected => "rejected",
            GatewayErrorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for GatewayErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[error("{kind}: {message}")]
pub struct GatewayError {
    pub kind: GatewayErrorKind,
    pub message: String,
}

impl GatewayError {
    pub fn new(kind: GatewayErrorKind, message: impl Into<String>) -> Self {
        GatewayError {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(GatewayErrorKind::Timeout, message)
    }

    /// `rejected` is the only kind that will not succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        self.kind != GatewayErrorKind::Rejected
    }
}

impl From<GraphqlFailure> for GatewayError {
    fn from(failure: GraphqlFailure) -> Self {
        let kind = match &failure {
            GraphqlFailure::Timeout(_) => GatewayErrorKind::Timeout,
            GraphqlFailure::Transport(_) | GraphqlFailure::MissingData => GatewayErrorKind::Unknown,
            GraphqlFailure::Status { status, .. } => classify_status(*status),
            GraphqlFailure::Errors(errors) => classify_errors(errors),
        };
        GatewayError::new(kind, failure.to_string())
    }
}

fn classify_status(status: StatusCode) -> GatewayErrorKind {
    match status {
        StatusCode::TOO_MANY_REQUESTS => GatewayErrorKind::RateLimited,
        StatusCode::BAD_REQUEST
        | StatusCode::UNAUTHORIZED
        | StatusCode::FORBIDDEN
        | StatusCode::NOT_FOUND
        | StatusCode::UNPROCESSABLE_ENTITY => GatewayErrorKind::Rejected,
        _ => GatewayErrorKind::Unknown,
    }
}

// The first typed error decides.
fn classify_errors(errors: &[GraphqlError]) -> GatewayErrorKind {
    errors
        .iter()
        .find_map(|e| match e.kind.as_deref() {
            Some("RATE_LIMITED") => Some(GatewayErrorKind::RateLimited),
            Some("FORBIDDEN" | "NOT_FOUND" | "UNPROCESSABLE") => Some(GatewayErrorKind::Rejected),
            _ => None,
        })
        .unwrap_or(GatewayErrorKind::Unknown)
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Creates a one-time sponsorship of `amount` cents and returns its id.
    async fn create_subscription(
        &self,
        payee_account_id: &str,
        amount: u64,
    ) -> Result<String, GatewayError>;

    async fn cancel_subscription(&self, transaction_id: &str) -> Result<(), GatewayError>;
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateData {
    create_sponsorship: Option<CreatePayload>,
}

#[derive(Deserialize)]
struct CreatePayload {
    sponsorship: Option<Sponsorship>,
}

#[derive(Deserialize)]
struct Sponsorship {
    id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CancelData {
    cancel_sponsorship: Option<serde_json::Value>,
}

pub struct SponsorsClient {
    client: reqwest::Client,
    api_url: Url,
    token: String,
    sponsor_login: String,
}

impl SponsorsClient {
    pub fn new(config: &SponsorsConfig) -> Result<Self, reqwest::Error> {
        Self::build(
            config.api_url.clone(),
            &config.token,
            &config.sponsor_login,
            Duration::from_secs(config.timeout_secs),
        )
    }

    fn build(
        api_url: Url,
        token: &str,
        sponsor_login: &str,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("bounty-orchestrator/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(SponsorsClient {
            client,
            api_url,
            token: token.to_string(),
            sponsor_login: sponsor_login.to_string(),
        })
    }
}

#[async_trait]
impl PaymentGateway for SponsorsClient {
    async fn create_subscription(
        &self,
        payee_account_id: &str,
        amount: u64,
    ) -> Result<String, GatewayError> {
        if amount == 0 || amount % 100 != 0 {
            return Err(GatewayError::new(
                GatewayErrorKind::Rejected,
                format!("amount {amount} is not a positive whole-dollar value"),
            ));
        }

        let variables = json!({
            "input": {
                "sponsorLogin": self.sponsor_login,
                "sponsorableId": payee_account_id,
                "amount": amount / 100,
                "isRecurring": false,
                "privacyLevel": "PRIVATE",
            }
        });

        let data: CreateData = graphql::execute(
            &self.client,
            &self.api_url,
            &self.token,
            CREATE_SPONSORSHIP,
            variables,
        )
        .await?;

        let id = data
            .create_sponsorship
            .and_then(|payload| payload.sponsorship)
            .map(|sponsorship| sponsorship.id)
            .ok_or_else(|| GatewayError::from(GraphqlFailure::MissingData))?;

        tracing::debug!(sponsorship_id = %id, payee_account_id, "created sponsorship");
        Ok(id)
    }

    async fn cancel_subscription(&self, transaction_id: &str) -> Result<(), GatewayError> {
        let variables = json!({
            "input": {
                "sponsorLogin": self.sponsor_login,
                "sponsorshipId": transaction_id,
            }
        });

        let data: CancelData = graphql::execute(
            &self.client,
            &self.api_url,
            &self.token,
            CANCEL_SPONSORSHIP,
            variables,
        )
        .await?;

        if data.cancel_sponsorship.is_none() {
            return Err(GraphqlFailure::MissingData.into());
        }

        tracing::debug!(sponsorship_id = transaction_id, "cancelled sponsorship");
        Ok(())
    }
}
