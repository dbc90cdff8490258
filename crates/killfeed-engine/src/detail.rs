//! Client for the detail source (authoritative killmail records).
//!
//! Every call consults the shared error-budget coordinator before sending and
//! feeds the budget headers of the response back into it, success or not.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, USER_AGENT};
use reqwest::{StatusCode, Url};
use tokio_util::sync::CancellationToken;

use killfeed_store::models::DetailRecord;

use crate::coordinator::ErrorBudget;
use crate::sources::DetailSource;

/// Response header carrying the remaining error budget.
pub const ERROR_LIMIT_REMAIN: &str = "X-Esi-Error-Limit-Remain";
/// Response header carrying the seconds until the budget window rolls.
pub const ERROR_LIMIT_RESET: &str = "X-Esi-Error-Limit-Reset";

const TIMEOUT_SENTINEL: &str = "timeout contacting tranquility";
const ERROR_LIMIT_SENTINEL: &str = "error limit";
const BODY_SNIPPET_MAX: usize = 256;

/// Classified failures of a detail fetch.
#[derive(Debug, thiserror::Error)]
pub enum DetailError {
    /// Transport-level timeout or the source's timeout sentinel body.
    #[error("detail request timed out: {0}")]
    Timeout(String),

    /// The source reported its error budget as exhausted (HTTP 420 or the
    /// error-limit sentinel body).
    #[error("detail source error budget exhausted")]
    BudgetExhausted,

    /// Any other non-success status.
    #[error("detail source returned {status}: {body}")]
    Transport {
        /// HTTP status code.
        status: u16,
        /// Response body, truncated.
        body: String,
    },

    /// The request could not be completed (connect failure, ...).
    #[error("detail request failed: {0}")]
    Network(String),

    /// The response body was not a valid detail record.
    #[error("invalid detail response: {0}")]
    Parse(String),

    /// The owning job was cancelled while the fetch was pending.
    #[error("detail fetch cancelled")]
    Cancelled,
}

/// HTTP client for the detail source.
#[derive(Debug, Clone)]
pub struct EsiClient {
    http: reqwest::Client,
    base: Url,
    user_agent: String,
    budget: Arc<ErrorBudget>,
    timeout: Duration,
}

impl EsiClient {
    /// Default per-call timeout.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

    /// New client against `base` (e.g. `https://esi.evetech.net/`), reporting
    /// budget headers to `budget`.
    pub fn new(
        http: reqwest::Client,
        base: Url,
        user_agent: String,
        budget: Arc<ErrorBudget>,
    ) -> Self {
        Self {
            http,
            base,
            user_agent,
            budget,
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }
}

#[async_trait]
impl DetailSource for EsiClient {
    async fn killmail(
        &self,
        killmail_id: i64,
        hash: &str,
        cancel: &CancellationToken,
    ) -> Result<DetailRecord, DetailError> {
        self.budget
            .acquire(cancel)
            .await
            .map_err(|_| DetailError::Cancelled)?;

        let url = self
            .base
            .join(&format!(
                "latest/killmails/{killmail_id}/{hash}/?datasource=tranquility"
            ))
            .map_err(|err| DetailError::Parse(err.to_string()))?;

        let res = self
            .http
            .get(url)
            .header(USER_AGENT, self.user_agent.as_str())
            .timeout(self.timeout)
            .send()
            .await;

        let res = match res {
            Ok(res) => res,
            Err(err) if err.is_timeout() => return Err(DetailError::Timeout(err.to_string())),
            Err(err) => return Err(DetailError::Network(err.to_string())),
        };

        observe_budget_headers(&self.budget, res.headers());

        let status = res.status();
        let body = res
            .text()
            .await
            .map_err(|err| DetailError::Network(err.to_string()))?;

        if status.is_success() {
            return serde_json::from_str(&body).map_err(|err| DetailError::Parse(err.to_string()));
        }

        Err(classify_failure(&self.budget, status, &body))
    }
}

/// Feed the budget headers into the coordinator. Both headers must be present
/// and numeric; anything else is ignored.
fn observe_budget_headers(budget: &ErrorBudget, headers: &HeaderMap) {
    let remain = headers
        .get(ERROR_LIMIT_REMAIN)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u32>().ok());
    let reset = headers
        .get(ERROR_LIMIT_RESET)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());

    if let (Some(remain), Some(reset)) = (remain, reset) {
        budget.observe(remain, reset);
    }
}

fn classify_failure(budget: &ErrorBudget, status: StatusCode, body: &str) -> DetailError {
    if is_timeout_body(body) {
        return DetailError::Timeout(truncate_body(body));
    }
    if status.as_u16() == 420 || is_error_limit_body(body) {
        budget.penalize();
        return DetailError::BudgetExhausted;
    }
    budget.penalize();
    DetailError::Transport {
        status: status.as_u16(),
        body: truncate_body(body),
    }
}

fn is_timeout_body(body: &str) -> bool {
    body.to_ascii_lowercase().contains(TIMEOUT_SENTINEL)
}

fn is_error_limit_body(body: &str) -> bool {
    body.to_ascii_lowercase().contains(ERROR_LIMIT_SENTINEL)
}

pub(crate) fn truncate_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.len() <= BODY_SNIPPET_MAX {
        return trimmed.to_string();
    }
    let mut cut = BODY_SNIPPET_MAX;
    while !trimmed.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}…", &trimmed[..cut])
}
