//! Shared HTTP fetch layer + payload hashing for Prospector collaborators.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::RequestBuilder;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};

pub const CRATE_NAME: &str = "prospector-fetch";

pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Replay schedule for requests that carry an idempotency key. The wait
/// doubles per replay up to `ceiling`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayPolicy {
    pub max_replays: u32,
    pub first_delay: Duration,
    pub ceiling: Duration,
}

impl Default for ReplayPolicy {
    fn default() -> Self {
        Self {
            max_replays: 3,
            first_delay: Duration::from_millis(250),
            ceiling: Duration::from_secs(5),
        }
    }
}

impl ReplayPolicy {
    pub fn never() -> Self {
        Self {
            max_replays: 0,
            ..Self::default()
        }
    }

    pub fn wait_before(&self, replay: u32) -> Duration {
        self.first_delay
            .saturating_mul(2u32.saturating_pow(replay))
            .min(self.ceiling)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Hard bound on every request, connect through body.
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_target_concurrency: usize,
    pub replay: ReplayPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 16,
            per_target_concurrency: 4,
            replay: ReplayPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("decoding response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl FetchError {
    /// Throttling, upstream 5xx, or a request that never got an answer.
    /// Anything else would fail the same way again.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::HttpStatus { status, .. } => *status == 429 || (500..600).contains(status),
            FetchError::Request(err) => err.is_timeout() || err.is_connect() || err.is_request(),
            FetchError::Decode { .. } => false,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::HttpStatus { status, .. } => Some(*status),
            FetchError::Request(err) => err.status().map(|s| s.as_u16()),
            FetchError::Decode { .. } => None,
        }
    }
}

/// JSON-over-HTTP client shared by providers, enrichment and the bulk writer.
///
/// Concurrency is capped globally and per target (provider id, collaborator
/// name). Only requests that carry an idempotency key are retried in-call.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_target_limit: usize,
    per_target: Mutex<HashMap<String, Arc<Semaphore>>>,
    replay: ReplayPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
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
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_target_limit: config.per_target_concurrency.max(1),
            per_target: Mutex::new(HashMap::new()),
            replay: config.replay,
        })
    }

    async fn per_target_semaphore(&self, target: &str) -> Arc<Semaphore> {
        let mut map = self.per_target.lock().await;
        map.entry(target.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_target_limit)))
            .clone()
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        target: &str,
        url: &str,
        bearer: Option<&str>,
    ) -> Result<T, FetchError> {
        let span = info_span!("http_fetch", target, method = "GET", url);
        self.execute(target, url, false, || {
            with_bearer(self.client.get(url), bearer)
        })
        .instrument(span)
        .await
    }

    /// POSTs `body` as JSON. With an idempotency key a transient failure is
    /// replayed on the configured schedule.
    pub async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        target: &str,
        url: &str,
        bearer: Option<&str>,
        body: &B,
        idempotency_key: Option<&str>,
    ) -> Result<T, FetchError> {
        let span = info_span!("http_fetch", target, method = "POST", url);
        self.execute(target, url, idempotency_key.is_some(), || {
            let mut builder = with_bearer(self.client.post(url), bearer).json(body);
            if let Some(key) = idempotency_key {
                builder = builder.header(IDEMPOTENCY_KEY_HEADER, key);
            }
            builder
        })
        .instrument(span)
        .await
    }

    async fn execute<T, F>(
        &self,
        target: &str,
        url: &str,
        idempotent: bool,
        build: F,
    ) -> Result<T, FetchError>
    where
        T: DeserializeOwned,
        F: Fn() -> RequestBuilder,
    {
        let _global = self.global_limit.acquire().await.expect("semaphore not closed");
        let per_target = self.per_target_semaphore(target).await;
        let _target = per_target.acquire().await.expect("semaphore not closed");

        let replay = if idempotent { self.replay } else { ReplayPolicy::never() };
        let mut replays = 0u32;

        loop {
            let err = match send_once(build()).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if replays >= replay.max_replays || !err.is_transient() {
                return Err(err);
            }
            let wait = replay.wait_before(replays);
            debug!(error = %err, replays, ?wait, url, "replaying idempotent request");
            tokio::time::sleep(wait).await;
            replays += 1;
        }
    }
}

async fn send_once<T: DeserializeOwned>(request: RequestBuilder) -> Result<T, FetchError> {
    let resp = request.send().await?;
    let status = resp.status();
    let url = resp.url().to_string();
    if !status.is_success() {
        return Err(FetchError::HttpStatus {
            status: status.as_u16(),
            url,
        });
    }
    let body = resp.bytes().await?;
    serde_json::from_slice(&body).map_err(|source| FetchError::Decode { url, source })
}

fn with_bearer(builder: RequestBuilder, bearer: Option<&str>) -> RequestBuilder {
    match bearer {
        Some(token) => builder.bearer_auth(token),
        None => builder,
    }
}
