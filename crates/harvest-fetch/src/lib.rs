//! Paginated listing fetcher with retry classification and exponential backoff.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use harvest_core::{
    EventSink, FeedDescriptor, HarvestEvent, Listing, PageResponse, RetryCause, SkipReason, Sleeper,
};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{info_span, Instrument};

pub const CRATE_NAME: &str = "harvest-fetch";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// 403 is how the CDN in front of the API answers bursts, so it is treated like 429.
pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::FORBIDDEN
    {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub multiplier: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 100,
            initial_delay: Duration::from_secs(3),
            multiplier: 2,
        }
    }
}

impl BackoffPolicy {
    /// Delay before the retry that follows the `retry_index`-th failed attempt (zero based).
    pub fn delay_for_retry(&self, retry_index: u32) -> Duration {
        let factor = self.multiplier.saturating_pow(retry_index);
        self.initial_delay.saturating_mul(factor)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("http status {status} for feed {feed} page {page}")]
    HttpStatus { feed: String, page: u32, status: u16 },
    #[error(
        "retries exhausted for feed {feed} page {page} after {attempts} attempts ({last_cause})"
    )]
    RetriesExhausted {
        feed: String,
        page: u32,
        attempts: u32,
        last_cause: RetryCause,
    },
    #[error("cannot build request for feed {feed}: {source}")]
    InvalidRequest {
        feed: String,
        #[source]
        source: reqwest::Error,
    },
}

enum AttemptOutcome {
    Success(PageResponse),
    Retry(RetryCause),
    Fatal(FetchError),
}

enum FetchState {
    Attempting { attempt: u32 },
    RetryWait { attempt: u32, cause: RetryCause },
}

pub struct PageFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
    sleeper: Arc<dyn Sleeper>,
    events: Arc<dyn EventSink>,
}

impl PageFetcher {
    pub fn new(
        config: HttpClientConfig,
        sleeper: Arc<dyn Sleeper>,
        events: Arc<dyn EventSink>,
    ) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            backoff: config.backoff,
            sleeper,
            events,
        })
    }

    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    /// Fetches one page, retrying transient failures until the attempt budget runs out.
    ///
    /// A 2xx response whose body does not decode yields an empty page, which callers read as
    /// the end of the feed.
    pub async fn fetch_page(
        &self,
        feed: &FeedDescriptor,
        page: u32,
    ) -> Result<PageResponse, FetchError> {
        let span = info_span!("fetch_page", feed = %feed.name, page);
        self.run_attempts(feed, page).instrument(span).await
    }

    async fn run_attempts(
        &self,
        feed: &FeedDescriptor,
        page: u32,
    ) -> Result<PageResponse, FetchError> {
        let max_attempts = self.backoff.max_attempts.max(1);
        let mut state = FetchState::Attempting { attempt: 1 };

        loop {
            state = match state {
                FetchState::Attempting { attempt } => match self.attempt(feed, page).await {
                    AttemptOutcome::Success(response) => return Ok(response),
                    AttemptOutcome::Fatal(err) => return Err(err),
                    AttemptOutcome::Retry(cause) if attempt >= max_attempts => {
                        return Err(FetchError::RetriesExhausted {
                            feed: feed.name.clone(),
                            page,
                            attempts: attempt,
                            last_cause: cause,
                        });
                    }
                    AttemptOutcome::Retry(cause) => FetchState::RetryWait { attempt, cause },
                },
                FetchState::RetryWait { attempt, cause } => {
                    let delay = self.backoff.delay_for_retry(attempt - 1);
                    self.events.emit(HarvestEvent::FetchRetry {
                        feed: feed.name.clone(),
                        page,
                        attempt,
                        cause,
                        delay,
                    });
                    self.sleeper.sleep(delay).await;
                    FetchState::Attempting {
                        attempt: attempt + 1,
                    }
                }
            };
        }
    }

    async fn attempt(&self, feed: &FeedDescriptor, page: u32) -> AttemptOutcome {
        let request = self
            .client
            .get(&feed.endpoint)
            .query(&feed.params)
            .query(&[("page", page)]);

        let response = match request.send().await {
            Ok(response) => response,
            Err(err) if err.is_builder() => {
                return AttemptOutcome::Fatal(FetchError::InvalidRequest {
                    feed: feed.name.clone(),
                    source: err,
                });
            }
            Err(err) => return AttemptOutcome::Retry(RetryCause::Transport(err.to_string())),
        };

        let status = response.status();
        if status.is_success() {
            return match response.bytes().await {
                Ok(body) => AttemptOutcome::Success(self.decode_page(feed, page, &body)),
                Err(err) => AttemptOutcome::Retry(RetryCause::Transport(err.to_string())),
            };
        }

        match classify_status(status) {
            RetryDisposition::Retryable => {
                AttemptOutcome::Retry(RetryCause::Status(status.as_u16()))
            }
            RetryDisposition::NonRetryable => AttemptOutcome::Fatal(FetchError::HttpStatus {
                feed: feed.name.clone(),
                page,
                status: status.as_u16(),
            }),
        }
    }

    /// Only an undecodable envelope empties the page. Records are decoded one by one so a
    /// single mistyped listing is skipped without losing its siblings or the continuation.
    fn decode_page(&self, feed: &FeedDescriptor, page: u32, body: &[u8]) -> PageResponse {
        let envelope = match serde_json::from_slice::<PageEnvelope>(body) {
            Ok(envelope) => envelope,
            Err(err) => {
                self.events.emit(HarvestEvent::MalformedPage {
                    feed: feed.name.clone(),
                    page,
                    error: err.to_string(),
                });
                return PageResponse::default();
            }
        };

        let mut results = Vec::with_capacity(envelope.results.len());
        for entry in envelope.results {
            let id = entry.get("id").and_then(Value::as_i64).unwrap_or_default();
            match serde_json::from_value::<Listing>(entry) {
                Ok(listing) => results.push(listing),
                Err(err) => self.events.emit(HarvestEvent::RecordSkipped {
                    id,
                    reason: SkipReason::Undecodable(err.to_string()),
                }),
            }
        }

        let response = PageResponse {
            results,
            next: envelope.next.unwrap_or_default(),
            count: envelope.count.unwrap_or_default(),
        };
        self.events.emit(HarvestEvent::PageFetched {
            feed: feed.name.clone(),
            page,
            records: response.results.len(),
            advertised_total: response.count,
        });
        response
    }
}

/// Page body with the records left undecoded.
#[derive(Debug, Deserialize)]
struct PageEnvelope {
    #[serde(default)]
    results: Vec<Value>,
    #[serde(default)]
    next: Option<String>,
    #[serde(default)]
    count: Option<u64>,
}
