//! Minimal GraphQL-over-HTTP transport shared by the sponsorship and issue
//! tracker clients. Callers classify `GraphqlFailure` into their own errors.

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use url::Url;

#[derive(Serialize)]
struct GraphqlRequest<'a, V> {
    query: &'a str,
    variables: V,
}

#[derive(Deserialize)]
struct GraphqlResponse<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<GraphqlError>,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct GraphqlError {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub message: String,
}

#[derive(thiserror::Error, Debug)]
pub enum GraphqlFailure {
    #[error("request timed out: {0}")]
    Timeout(reqwest::Error),

    #[error("transport error: {0}")]
    Transport(reqwest::Error),

    #[error("unexpected status {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("graphql errors: {}", format_errors(.0))]
    Errors(Vec<GraphqlError>),

    #[error("response carried no data")]
    MissingData,
}

impl From<reqwest::Error> for GraphqlFailure {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            GraphqlFailure::Timeout(err)
        } else {
            GraphqlFailure::Transport(err)
        }
    }
}

fn format_errors(errors: &[GraphqlError]) -> String {
    errors
        .iter()
        .map(|e| match &e.kind {
            Some(kind) => format!("[{kind}] {}", e.message),
            None => e.message.clone(),
        })
        .collect::<Vec<_>>()
        .join("; ")
}

pub async fn execute<V, T>(
    client: &reqwest::Client,
    url: &Url,
    token: &str,
    query: &str,
    variables: V,
) -> Result<T, GraphqlFailure>
where
    V: Serialize,
    T: DeserializeOwned,
{
    let response = client
        .post(url.clone())
        .bearer_auth(token)
        .json(&GraphqlRequest { query, variables })
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(GraphqlFailure::Status { status, body });
    }

    let body: GraphqlResponse<T> = response.json().await?;
    if !body.errors.is_empty() {
        return Err(GraphqlFailure::Errors(body.errors));
    }
    body.data.ok_or(GraphqlFailure::MissingData)
}
