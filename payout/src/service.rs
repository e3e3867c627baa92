use crate::handler::PayoutHandler;
use crate::reporting::Reporting;
use crate::types::{IssueKey, PayoutRequest};
use http::header::AUTHORIZATION;
use hyper::body::{Body, Incoming};
use hyper::service::Service;
use hyper::{Method, Request, Response, StatusCode};
use serde_json::json;
use sha2::digest::Output;
use sha2::{Digest, Sha256};
use shared::http::{BodyError, ResponseBody, collect_body, json_response};
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use subtle::ConstantTimeEq;

const MAX_BODY_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Payout,
    Failed,
    History,
}

impl Route {
    fn from_path(path: &str) -> Option<Self> {
        match path.trim_end_matches('/') {
            "/bounty/payout" => Some(Route::Payout),
            "/bounty/failed" => Some(Route::Failed),
            "/bounty/history" => Some(Route::History),
            _ => None,
        }
    }

    fn method(&self) -> Method {
        match self {
            Route::Payout => Method::POST,
            Route::Failed | Route::History => Method::GET,
        }
    }
}

struct Inner {
    handler: Arc<PayoutHandler>,
    reporting: Reporting,
    auth_digest: Output<Sha256>,
}

/// The payout API: `POST /bounty/payout` plus the read-only reporting routes.
/// Every route requires the service bearer token.
#[derive(Clone)]
pub struct PayoutService {
    inner: Arc<Inner>,
}

impl PayoutService {
    pub fn new(handler: Arc<PayoutHandler>, reporting: Reporting, auth_token: String) -> Self {
        PayoutService {
            inner: Arc::new(Inner {
                handler,
                reporting,
                auth_digest: Sha256::digest(auth_token.as_bytes()),
            }),
        }
    }

    pub async fn dispatch<B>(&self, req: Request<B>) -> Response<ResponseBody>
    where
        B: Body,
        B::Error: Into<BodyError>,
    {
        let Some(route) = Route::from_path(req.uri().path()) else {
            return error_response(StatusCode::NOT_FOUND, "NotFound");
        };
        if req.method() != route.method() {
            return error_response(StatusCode::METHOD_NOT_ALLOWED, "MethodNotAllowed");
        }
        if !self.authorized(&req) {
            tracing::warn!(path = req.uri().path(), "rejected request with invalid credentials");
            return json_response(
                StatusCode::UNAUTHORIZED,
                &json!({"status": "rejected", "reason": "Unauthorized"}),
            );
        }

        match route {
            Route::Payout => self.payout(req).await,
            Route::Failed => self.failed().await,
            Route::History => self.history(req.uri().query().unwrap_or("")).await,
        }
    }

    fn authorized<B>(&self, req: &Request<B>) -> bool {
        req.headers()
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .is_some_and(|token| token_matches(token.trim(), &self.inner.auth_digest))
    }

    async fn payout<B>(&self, req: Request<B>) -> Response<ResponseBody>
    where
        B: Body,
        B::Error: Into<BodyError>,
    {
        let body = match collect_body(req.into_body(), MAX_BODY_BYTES).await {
            Ok(body) => body,
            Err(e) => return bad_request(format!("failed to read body: {e}")),
        };
        let request: PayoutRequest = match serde_json::from_slice(&body) {
            Ok(request) => request,
            Err(e) => return bad_request(format!("invalid payout request: {e}")),
        };

        match self.inner.handler.handle(request).await {
            Ok(receipt) => json_response(
                StatusCode::OK,
                &json!({
                    "status": receipt.cancellation.payout_status(),
                    "transaction_id": receipt.transaction_id,
                    "repositories_updated": [receipt.issue_key.repository],
                }),
            ),
            Err(err) => {
                let (status, body) = err.response_parts();
                json_response(status, &body)
            }
        }
    }

    async fn failed(&self) -> Response<ResponseBody> {
        match self.inner.reporting.failed_payouts().await {
            Ok(failed) => json_response(StatusCode::OK, &json!({ "failed": failed })),
            Err(e) => {
                tracing::error!(error = %e, "failed to list failed payouts");
                error_response(StatusCode::INTERNAL_SERVER_ERROR, "LedgerError")
            }
        }
    }

    async fn history(&self, query: &str) -> Response<ResponseBody> {
        let mut repository = None;
        let mut issue_number = None;
        for (name, value) in url::form_urlencoded::parse(query.as_bytes()) {
            match name.as_ref() {
                "repository" => repository = Some(value.into_owned()),
                "issue_number" => issue_number = value.parse::<u64>().ok(),
                _ => {}
            }
        }

        let (Some(repository), Some(issue_number)) = (repository, issue_number) else {
            return bad_request("repository and a numeric issue_number are required".into());
        };

        match self
            .inner
            .reporting
            .history(&IssueKey::new(&repository, issue_number))
            .await
        {
            Ok(Some(history)) => json_response(StatusCode::OK, &history),
            Ok(None) => error_response(StatusCode::NOT_FOUND, "NotFound"),
            Err(e) => {
                tracing::error!(error = %e, "failed to load payout history");
                error_response(StatusCode::INTERNAL_SERVER_ERROR, "LedgerError")
            }
        }
    }
}

impl Service<Request<Incoming>> for PayoutService {
    type Response = Response<ResponseBody>;
    type Error = Infallible;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let service = self.clone();
        Box::pin(async move { Ok(service.dispatch(req).await) })
    }
}

fn error_response(status: StatusCode, reason: &str) -> Response<ResponseBody> {
    json_response(status, &json!({"status": "error", "reason": reason}))
}

fn bad_request(detail: String) -> Response<ResponseBody> {
    json_response(
        StatusCode::BAD_REQUEST,
        &json!({"status": "error", "reason": "BadRequest", "detail": detail}),
    )
}

/// Compares fixed-size digests so neither the contents nor the length of the
/// presented token show up in response timing.
fn token_matches(presented: &str, expected: &Output<Sha256>) -> bool {
    Sha256::digest(presented.as_bytes())
        .as_slice()
        .ct_eq(expected.as_slice())
        .into()
}
