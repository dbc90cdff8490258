//! Client for the summary source (per-character killmail listing with
//! economic summaries).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;
use reqwest::header::USER_AGENT;

use killfeed_store::models::SummaryRef;

use crate::sources::SummarySource;

/// Errors from the summary client. Everything except `Invalid` is retriable.
#[derive(Debug, thiserror::Error)]
pub enum SummaryError {
    /// The request was rejected locally before anything was sent.
    #[error("invalid summary request: {0}")]
    Invalid(String),

    /// The request could not be completed (connect, timeout, ...).
    #[error("summary request failed: {0}")]
    Network(String),

    /// The source answered with a non-success status.
    #[error("summary source returned {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, truncated.
        body: String,
    },

    /// The response body was not a valid summary page.
    #[error("invalid summary response: {0}")]
    Parse(String),
}

/// Stateless HTTP client for the summary source.
#[derive(Debug, Clone)]
pub struct ZkillClient {
    http: reqwest::Client,
    base: Url,
    user_agent: String,
    timeout: Duration,
}

impl ZkillClient {
    /// Default per-call timeout.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

    /// New client against `base` (e.g. `https://zkillboard.com/`).
    pub fn new(http: reqwest::Client, base: Url, user_agent: String) -> Self {
        Self {
            http,
            base,
            user_agent,
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }
}

#[async_trait]
impl SummarySource for ZkillClient {
    async fn kills_page(
        &self,
        character_id: i64,
        page: u32,
    ) -> Result<Vec<SummaryRef>, SummaryError> {
        if character_id <= 0 {
            return Err(SummaryError::Invalid(format!(
                "character id must be positive, got {character_id}"
            )));
        }
        if page == 0 {
            return Err(SummaryError::Invalid("page numbers start at 1".to_string()));
        }

        let url = self
            .base
            .join(&format!("api/kills/characterID/{character_id}/page/{page}/"))
            .map_err(|err| SummaryError::Invalid(err.to_string()))?;

        let res = self
            .http
            .get(url)
            .header(USER_AGENT, self.user_agent.as_str())
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|err| SummaryError::Network(err.to_string()))?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(SummaryError::Status {
                status: status.as_u16(),
                body: crate::detail::truncate_body(&body),
            });
        }

        res.json::<Vec<SummaryRef>>()
            .await
            .map_err(|err| SummaryError::Parse(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> ZkillClient {
        ZkillClient::new(
            reqwest::Client::new(),
            Url::parse("https://zkillboard.invalid/").unwrap(),
            "killfeed test".to_string(),
        )
    }

    #[tokio::test]
    async fn rejects_zero_character_before_any_request() {
        let err = client().kills_page(0, 1).await.unwrap_err();
        assert!(matches!(err, SummaryError::Invalid(_)));
    }

    #[tokio::test]
    async fn rejects_page_zero_before_any_request() {
        let err = client().kills_page(100, 0).await.unwrap_err();
        assert!(matches!(err, SummaryError::Invalid(_)));
    }
}
