//! ==============================================================================
//! http.rs - hardened json GETs for the backend's external lookups
//! ==============================================================================
//!
//! purpose:
//!     one place that turns a reqwest GET into a bounded operation:
//!     - per-request timeout (set on the client)
//!     - retry with backoff for transport errors, 5xx and 429
//!     - circuit breaker so a dead upstream is not hammered per soil report
//!
//! relationships:
//!     - used by: weather.rs (points + forecast), location.rs (geocoding)
//!     - uses: retry.rs (RetryPolicy, CircuitBreaker)
//!
//! ==============================================================================

use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

use crate::retry::{CircuitBreaker, RetryPolicy};

#[derive(Debug, Error)]
pub enum LookupError {
    #[error("request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("unexpected status {status} from {url}")]
    Status { url: String, status: StatusCode },
    #[error("malformed response from {url}: {reason}")]
    Malformed { url: String, reason: String },
    #[error("{what} returned {got} item(s), need at least {min}")]
    TooFew {
        what: &'static str,
        got: usize,
        min: usize,
    },
    #[error("circuit open for {0}, lookup skipped")]
    CircuitOpen(&'static str),
}

impl LookupError {
    pub fn is_retryable(&self) -> bool {
        match self {
            LookupError::Http { source, .. } => {
                source.is_timeout() || source.is_connect() || source.is_request()
            }
            LookupError::Status { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            _ => false,
        }
    }

    pub fn malformed(url: &str, reason: impl Into<String>) -> Self {
        LookupError::Malformed {
            url: url.to_string(),
            reason: reason.into(),
        }
    }
}

/// reqwest client plus the retry/breaker policy for one upstream service
pub struct HttpLookup {
    name: &'static str,
    client: Client,
    retry: RetryPolicy,
    breaker: CircuitBreaker,
}

impl HttpLookup {
    pub fn new(
        name: &'static str,
        timeout: Duration,
        user_agent: &str,
        retry: RetryPolicy,
        breaker: CircuitBreaker,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()?;
        Ok(Self {
            name,
            client,
            retry,
            breaker,
        })
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// GET `url` with `query` and parse the body as json.
    pub async fn get_json(&self, url: &str, query: &[(&str, &str)]) -> Result<Value, LookupError> {
        if !self.breaker.allow() {
            return Err(LookupError::CircuitOpen(self.name));
        }

        let result = self
            .retry
            .run(self.name, |_| self.get_once(url, query), LookupError::is_retryable)
            .await;

        match &result {
            Ok(_) => self.breaker.record_success(),
            Err(e) if counts_against_upstream(e) => self.breaker.record_failure(),
            Err(_) => {}
        }
        result
    }

    async fn get_once(&self, url: &str, query: &[(&str, &str)]) -> Result<Value, LookupError> {
        let res = self
            .client
            .get(url)
            .query(query)
            .send()
            .await
            .map_err(|source| LookupError::Http {
                url: url.to_string(),
                source,
            })?;

        let status = res.status();
        if !status.is_success() {
            return Err(LookupError::Status {
                url: url.to_string(),
                status,
            });
        }

        res.json::<Value>()
            .await
            .map_err(|e| LookupError::malformed(url, e.to_string()))
    }
}

// 4xx other than 429 means the request was wrong, not that the upstream is down
fn counts_against_upstream(e: &LookupError) -> bool {
    match e {
        LookupError::Http { .. } | LookupError::Malformed { .. } => true,
        LookupError::Status { status, .. } => {
            status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
        }
        _ => false,
    }
}

/// Walk a json document by object keys, reporting the first missing key.
pub fn pointer<'a>(doc: &'a Value, url: &str, path: &[&str]) -> Result<&'a Value, LookupError> {
    let mut current = doc;
    for key in path {
        current = current
            .get(key)
            .ok_or_else(|| LookupError::malformed(url, format!("missing `{}`", path.join("."))))?;
    }
    Ok(current)
}
