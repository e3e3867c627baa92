pub mod config;
pub mod errors;
pub mod gateway;
mod graphql;
pub mod handler;
pub mod label;
pub mod ledger;
pub mod metrics_defs;
pub mod reporting;
pub mod retry;
pub mod service;
#[cfg(test)]
mod testutils;
pub mod tracker;
pub mod types;
pub mod validator;

use crate::gateway::{PaymentGateway, SponsorsClient};
use crate::handler::PayoutHandler;
use crate::ledger::{LedgerError, LedgerHandle};
use crate::reporting::Reporting;
use crate::retry::{CancellationEngine, RetryWorker};
use crate::service::PayoutService;
use crate::tracker::{GithubTracker, IssueTracker};
use crate::validator::Validator;
use shared::admin_service::AdminService;
use shared::http::run_http_service;
use std::sync::Arc;

#[derive(thiserror::Error, Debug)]
pub enum PayoutServiceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid configuration: {0}")]
    Config(#[from] config::ValidationError),
    #[error("could not open ledger: {0}")]
    Ledger(#[from] LedgerError),
    #[error("could not build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),
}

/// Opens the configured ledger for read-only reporting.
pub fn open_reporting(config: &config::Config) -> Result<Reporting, PayoutServiceError> {
    Ok(Reporting::new(ledger::open(&config.ledger)?))
}

/// Runs the payout API, the admin endpoints and the background retry worker until
/// a listener fails.
pub async fn run(config: config::Config) -> Result<(), PayoutServiceError> {
    config.validate()?;

    let ledger: LedgerHandle = ledger::open(&config.ledger)?;
    let tracker: Arc<dyn IssueTracker> = Arc::new(GithubTracker::new(&config.tracker)?);
    let gateway: Arc<dyn PaymentGateway> = Arc::new(SponsorsClient::new(&config.sponsors)?);

    let engine = Arc::new(CancellationEngine::new(
        ledger.clone(),
        gateway.clone(),
        config.retry.clone(),
    ));

    // No synchronous attempt can be in flight before the listeners start
    match engine.resume_interrupted().await {
        Ok(0) => {}
        Ok(count) => tracing::info!(count, "resumed interrupted payouts"),
        Err(err) => tracing::error!(error = %err, "failed to load interrupted payouts"),
    }
    let worker = RetryWorker::spawn(engine.clone());

    let validator = Validator::new(config.allowlist()?, tracker, ledger.clone());
    let handler = Arc::new(PayoutHandler::new(
        validator,
        ledger.clone(),
        gateway,
        engine,
    ));
    let service = PayoutService::new(handler, Reporting::new(ledger), config.auth_token.clone());

    let worker_ready = worker.clone();
    let admin = AdminService::new(move || worker_ready.is_running());

    tracing::info!(
        allowlist = ?config.allowlist,
        max_attempts = config.retry.max_attempts,
        "starting payout service"
    );

    let result = tokio::try_join!(
        run_http_service(&config.listener.host, config.listener.port, service),
        run_http_service(
            &config.admin_listener.host,
            config.admin_listener.port,
            admin
        ),
    );

    worker.shutdown().await;
    result?;
    Ok(())
}
