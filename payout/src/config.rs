use indexmap::IndexSet;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use url::Url;

#[derive(Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("Port cannot be 0")]
    InvalidPort,

    #[error("Service auth token cannot be empty")]
    EmptyAuthToken,

    #[error("Sponsor login cannot be empty")]
    EmptySponsorLogin,

    #[error("Repository allowlist is empty")]
    EmptyAllowlist,

    #[error("Allowlist entry is not of the form owner/repo: {0}")]
    InvalidRepository(String),

    #[error("Duplicate allowlist entry: {0}")]
    DuplicateRepository(String),

    #[error("Retry policy needs at least one attempt")]
    NoAttempts,

    #[error("Retry base delay exceeds the maximum delay")]
    InvalidBackoff,

    #[error("Timeout cannot be 0: {0}")]
    ZeroTimeout(&'static str),
}

/// Payout service configuration, loaded once at startup.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    /// Listener for the payout API
    pub listener: Listener,
    /// Listener for health and readiness checks
    pub admin_listener: Listener,
    /// Static bearer token the CI trigger presents
    pub auth_token: String,
    pub sponsors: SponsorsConfig,
    pub tracker: TrackerConfig,
    /// Repositories allowed to trigger payouts, in priority order
    pub allowlist: Vec<String>,
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Required; the in-memory ledger must be chosen explicitly
    pub ledger: LedgerConfig,
}

impl Config {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.listener.validate()?;
        self.admin_listener.validate()?;

        if self.auth_token.trim().is_empty() {
            return Err(ValidationError::EmptyAuthToken);
        }

        if self.sponsors.sponsor_login.trim().is_empty() {
            return Err(ValidationError::EmptySponsorLogin);
        }

        if self.sponsors.timeout_secs == 0 {
            return Err(ValidationError::ZeroTimeout("sponsors.timeout_secs"));
        }

        if self.tracker.timeout_secs == 0 {
            return Err(ValidationError::ZeroTimeout("tracker.timeout_secs"));
        }

        Allowlist::from_entries(&self.allowlist)?;
        self.retry.validate()?;

        Ok(())
    }

    pub fn allowlist(&self) -> Result<Allowlist, ValidationError> {
        Allowlist::from_entries(&self.allowlist)
    }
}

/// Network listener configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Listener {
    pub host: String,
    pub port: u16,
}

impl Listener {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.port == 0 {
            return Err(ValidationError::InvalidPort);
        }
        Ok(())
    }
}

fn default_timeout_secs() -> u64 {
    10
}

/// Credentials for the sponsorship platform's GraphQL API.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct SponsorsConfig {
    pub api_url: Url,
    pub token: String,
    /// Account that pays the sponsorships
    pub sponsor_login: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

/// Credentials for the issue tracker's REST and GraphQL APIs.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct TrackerConfig {
    pub api_url: Url,
    pub graphql_url: Url,
    pub token: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
#[serde(tag = "type")]
pub enum LedgerConfig {
    /// Not durable: paid issues are forgotten on restart
    Memory,
    Sqlite { path: PathBuf },
}

/// Bounds on cancellation retries.
///
/// `max_attempts` counts every attempt, including the synchronous one made
/// while the payout request is still open.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_secs: u64,
    pub max_delay_secs: u64,
    pub sync_attempt_timeout_secs: u64,
    pub poll_interval_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 5,
            base_delay_secs: 30,
            max_delay_secs: 30 * 60,
            sync_attempt_timeout_secs: 10,
            poll_interval_secs: 5,
        }
    }
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_attempts == 0 {
            return Err(ValidationError::NoAttempts);
        }
        if self.base_delay_secs > self.max_delay_secs {
            return Err(ValidationError::InvalidBackoff);
        }
        if self.sync_attempt_timeout_secs == 0 {
            return Err(ValidationError::ZeroTimeout("retry.sync_attempt_timeout_secs"));
        }
        if self.poll_interval_secs == 0 {
            return Err(ValidationError::ZeroTimeout("retry.poll_interval_secs"));
        }
        Ok(())
    }

    /// Delay before the next attempt when `attempts_made` attempts have failed:
    /// `base * 2^(attempts_made - 1)`, capped at the maximum delay.
    pub fn delay_after(&self, attempts_made: u32) -> Duration {
        let exponent = attempts_made.saturating_sub(1).min(63);
        let delay = self
            .base_delay_secs
            .saturating_mul(1u64 << exponent)
            .min(self.max_delay_secs);
        Duration::from_secs(delay)
    }

    pub fn sync_attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.sync_attempt_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// How long after its payment was recorded a `PaymentCreated` record counts
    /// as interrupted. The synchronous attempt and the ledger write that
    /// follows it both fit inside this window.
    pub fn interrupted_after(&self) -> Duration {
        self.sync_attempt_timeout().saturating_mul(2)
    }
}

/// Repositories allowed to trigger payouts. Entries are lowercased to match
/// `IssueKey` normalization; insertion order is kept.
#[derive(Clone, Debug, PartialEq)]
pub struct Allowlist(IndexSet<String>);

impl Allowlist {
    pub fn from_entries<S: AsRef<str>>(entries: &[S]) -> Result<Self, ValidationError> {
        if entries.is_empty() {
            return Err(ValidationError::EmptyAllowlist);
        }

        let mut set = IndexSet::with_capacity(entries.len());
        for entry in entries {
            let repository = entry.as_ref().trim().to_ascii_lowercase();
            let valid = matches!(
                repository.split_once('/'),
                Some((owner, name)) if !owner.is_empty() && !name.is_empty() && !name.contains('/')
            );
            if !valid {
                return Err(ValidationError::InvalidRepository(entry.as_ref().to_string()));
            }
            if !set.insert(repository.clone()) {
                return Err(ValidationError::DuplicateRepository(repository));
            }
        }

        Ok(Allowlist(set))
    }

    pub fn contains(&self, repository: &str) -> bool {
        self.0.contains(&repository.trim().to_ascii_lowercase())
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}
