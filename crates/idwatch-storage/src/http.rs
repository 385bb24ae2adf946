//! Rate-limited GET client shared by every call against the search API.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

/// Server errors and throttling are worth another try; other statuses are final.
pub fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

pub fn is_transient_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

/// Doubling delay between retries, clamped to `ceiling`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_retries: u32,
    pub initial: Duration,
    pub ceiling: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial: Duration::from_millis(500),
            ceiling: Duration::from_secs(10),
        }
    }
}

impl BackoffPolicy {
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = 2u32.checked_pow(retry).unwrap_or(u32::MAX);
        self.initial.saturating_mul(factor).min(self.ceiling)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Sent as `Authorization: OAuth oauth_consumer_key="..."` on every request.
    pub api_key: Option<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            user_agent: None,
            api_key: None,
            global_concurrency: 64,
            per_source_concurrency: 8,
            backoff: BackoffPolicy::default(),
        }
    }
}

pub fn oauth_header_value(api_key: &str) -> String {
    format!("OAuth oauth_consumer_key=\"{api_key}\"")
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("concurrency limiter closed")]
    LimiterClosed,
}

/// Body of a successful response, with the URL after redirects.
#[derive(Debug, Clone)]
pub struct FetchedBody {
    pub url: String,
    pub body: Vec<u8>,
}

struct FailedAttempt {
    error: FetchError,
    transient: bool,
}

impl From<reqwest::Error> for FailedAttempt {
    fn from(err: reqwest::Error) -> Self {
        Self {
            transient: is_transient_error(&err),
            error: FetchError::Request(err),
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global: Semaphore,
    per_source_limit: usize,
    sources: Mutex<HashMap<String, Arc<Semaphore>>>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        let api_key = config.api_key.as_deref().map(str::trim).unwrap_or_default();
        if !api_key.is_empty() {
            let value = HeaderValue::from_str(&oauth_header_value(api_key))
                .context("api key is not a valid header value")?;
            headers.insert(AUTHORIZATION, value);
        }

        let mut builder = reqwest::Client::builder()
            .default_headers(headers)
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(agent) = config.user_agent.as_deref() {
            builder = builder.user_agent(agent);
        }

        Ok(Self {
            client: builder.build().context("building http client")?,
            global: Semaphore::new(config.global_concurrency.max(1)),
            per_source_limit: config.per_source_concurrency.max(1),
            sources: Mutex::new(HashMap::new()),
            backoff: config.backoff,
        })
    }

    async fn source_limit(&self, source_id: &str) -> Arc<Semaphore> {
        let mut sources = self.sources.lock().await;
        Arc::clone(
            sources
                .entry(source_id.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit))),
        )
    }

    /// GET `url` once a global and a per-source permit are free.
    ///
    /// Transient failures are retried with backoff while the permits are
    /// held; any other non-2xx status fails at once.
    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
        accept: Option<&'static str>,
    ) -> Result<FetchedBody, FetchError> {
        let _global = self.global.acquire().await.map_err(|_| FetchError::LimiterClosed)?;
        let source = self.source_limit(source_id).await;
        let _source = source.acquire().await.map_err(|_| FetchError::LimiterClosed)?;

        let span = info_span!("http_fetch", %run_id, source_id, url);
        async {
            let mut retry = 0u32;
            loop {
                let failed = match self.attempt(url, accept).await {
                    Ok(body) => return Ok(body),
                    Err(failed) => failed,
                };
                if !failed.transient || retry >= self.backoff.max_retries {
                    return Err(failed.error);
                }
                let delay = self.backoff.delay(retry);
                warn!(retry, delay_ms = delay.as_millis() as u64, error = %failed.error, "transient fetch failure, backing off");
                tokio::time::sleep(delay).await;
                retry += 1;
            }
        }
        .instrument(span)
        .await
    }

    async fn attempt(&self, url: &str, accept: Option<&'static str>) -> Result<FetchedBody, FailedAttempt> {
        let mut request = self.client.get(url);
        if let Some(accept) = accept {
            request = request.header(ACCEPT, accept);
        }
        let response = request.send().await?;
        let status = response.status();
        let final_url = response.url().to_string();
        if !status.is_success() {
            return Err(FailedAttempt {
                transient: is_transient_status(status),
                error: FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                },
            });
        }
        let body = response.bytes().await?;
        Ok(FetchedBody {
            url: final_url,
            body: body.to_vec(),
        })
    }
}
