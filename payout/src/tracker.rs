use crate::config::TrackerConfig;
use crate::graphql::{self, GraphqlFailure};
use crate::types::IssueKey;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use url::Url;

const SPONSORABLE_USER: &str = "query($login: String!) {
  user(login: $login) { id hasSponsorsListing }
}";

#[derive(thiserror::Error, Debug)]
pub enum TrackerError {
    #[error("issue tracker request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("issue tracker returned status {0}")]
    Status(StatusCode),
    #[error("issue tracker query failed: {0}")]
    Graphql(#[from] GraphqlFailure),
}

/// Issue metadata the validator needs.
#[derive(Clone, Debug, PartialEq)]
pub struct TrackedIssue {
    /// Label names in the tracker's order
    pub labels: Vec<String>,
    pub assignee: Option<Assignee>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Assignee {
    pub login: String,
    /// Sponsorable account id, when the user can receive sponsorships
    pub payee_account_id: Option<String>,
}

#[async_trait]
pub trait IssueTracker: Send + Sync {
    /// Returns `None` when the issue does not exist.
    async fn issue(&self, key: &IssueKey) -> Result<Option<TrackedIssue>, TrackerError>;
}

#[derive(Deserialize)]
struct IssueResponse {
    #[serde(default)]
    labels: Vec<LabelResponse>,
    assignee: Option<UserResponse>,
}

#[derive(Deserialize)]
struct LabelResponse {
    name: String,
}

#[derive(Deserialize)]
struct UserResponse {
    login: String,
}

#[derive(Deserialize)]
struct UserData {
    user: Option<SponsorableUser>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SponsorableUser {
    id: String,
    has_sponsors_listing: bool,
}

/// GitHub-backed tracker: issue data over REST, payee resolution over GraphQL.
pub struct GithubTracker {
    client: reqwest::Client,
    api_url: String,
    graphql_url: Url,
    token: String,
}

impl GithubTracker {
    pub fn new(config: &TrackerConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("bounty-orchestrator/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(GithubTracker {
            client,
            api_url: config.api_url.as_str().trim_end_matches('/').to_string(),
            graphql_url: config.graphql_url.clone(),
            token: config.token.clone(),
        })
    }

    async fn payee_account(&self, login: &str) -> Result<Option<String>, TrackerError> {
        let data: UserData = graphql::execute(
            &self.client,
            &self.graphql_url,
            &self.token,
            SPONSORABLE_USER,
            json!({ "login": login }),
        )
        .await?;

        Ok(data
            .user
            .filter(|user| user.has_sponsors_listing)
            .map(|user| user.id))
    }
}

#[async_trait]
impl IssueTracker for GithubTracker {
    async fn issue(&self, key: &IssueKey) -> Result<Option<TrackedIssue>, TrackerError> {
        let url = format!(
            "{}/repos/{}/issues/{}",
            self.api_url, key.repository, key.issue_number
        );

        let response = self
            .client
            .get(url)
            .bearer_auth(&self.token)
            .header(reqwest::header::ACCEPT, "application/vnd.github+json")
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND | StatusCode::GONE => return Ok(None),
            status => return Err(TrackerError::Status(status)),
        }

        let issue: IssueResponse = response.json().await?;

        let assignee = match issue.assignee {
            Some(user) => Some(Assignee {
                payee_account_id: self.payee_account(&user.login).await?,
                login: user.login,
            }),
            None => None,
        };

        Ok(Some(TrackedIssue {
            labels: issue.labels.into_iter().map(|l| l.name).collect(),
            assignee,
        }))
    }
}
