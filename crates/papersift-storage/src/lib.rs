//! Result dump storage, polite HTTP fetching and the Feishu table/document client.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use papersift_core::{RatingResult, Source};
use reqwest::StatusCode;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{info_span, Instrument};
use uuid::Uuid;

pub mod feishu;

pub use feishu::{
    FeishuClient, FeishuConfig, FeishuError, RubricSource, TableDestination, TableRow, TableSink,
};

pub const CRATE_NAME: &str = "papersift-storage";

#[derive(Debug, Clone, Serialize)]
pub struct StoredDump {
    pub source: Source,
    pub path: PathBuf,
    pub records: usize,
    pub byte_size: usize,
    pub sha256: String,
    pub written_at: DateTime<Utc>,
}

/// Writes one `<source>_results.json` per source for audit. Never read back by the pipeline.
#[derive(Debug, Clone)]
pub struct ResultDumpStore {
    root: PathBuf,
}

impl ResultDumpStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn dump_path(&self, source: Source) -> PathBuf {
        self.root.join(format!("{}_results.json", source.as_str()))
    }

    pub async fn write_results(
        &self,
        source: Source,
        results: &[RatingResult],
    ) -> anyhow::Result<StoredDump> {
        let bytes = serde_json::to_vec_pretty(results)
            .with_context(|| format!("serializing {source} results"))?;
        let path = self.dump_path(source);
        write_atomically(&path, &bytes).await?;
        Ok(StoredDump {
            source,
            path,
            records: results.len(),
            byte_size: bytes.len(),
            sha256: Self::sha256_hex(&bytes),
            written_at: Utc::now(),
        })
    }

    pub async fn write_json<T: Serialize + ?Sized>(
        &self,
        file_name: &str,
        value: &T,
    ) -> anyhow::Result<PathBuf> {
        let bytes = serde_json::to_vec_pretty(value)
            .with_context(|| format!("serializing {file_name}"))?;
        let path = self.root.join(file_name);
        write_atomically(&path, &bytes).await?;
        Ok(path)
    }
}

/// Replace `path` through a sibling temp file so readers never observe a half-written dump.
async fn write_atomically(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating results directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!("renaming {} -> {}", temp_path.display(), path.display())
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub per_source_concurrency: usize,
    /// Minimum spacing between request starts, per source key.
    pub min_intervals: HashMap<String, Duration>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        let mut min_intervals = HashMap::new();
        // export.arxiv.org asks clients to wait three seconds between calls.
        min_intervals.insert(Source::Arxiv.as_str().to_string(), Duration::from_secs(3));
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            per_source_concurrency: 2,
            min_intervals,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Hands out request slots no closer together than `interval`.
#[derive(Debug)]
pub struct RequestPacer {
    interval: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl RequestPacer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_slot: Mutex::new(None),
        }
    }

    pub async fn wait_turn(&self) {
        let mut next_slot = self.next_slot.lock().await;
        let now = Instant::now();
        let start = match *next_slot {
            Some(slot) if slot > now => {
                tokio::time::sleep_until(slot).await;
                slot
            }
            _ => now,
        };
        *next_slot = Some(start + self.interval);
    }
}

#[derive(Debug, Default)]
struct SourceLimits {
    permits: Option<Arc<Semaphore>>,
    pacer: Option<Arc<RequestPacer>>,
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    per_source_concurrency: usize,
    min_intervals: HashMap<String, Duration>,
    limits: Mutex<HashMap<String, SourceLimits>>,
    backoff: BackoffPolicy,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
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
            per_source_concurrency: config.per_source_concurrency.max(1),
            min_intervals: config.min_intervals,
            limits: Mutex::new(HashMap::new()),
            backoff: config.backoff,
        })
    }

    async fn limits_for(&self, source_key: &str) -> (Arc<Semaphore>, Option<Arc<RequestPacer>>) {
        let mut map = self.limits.lock().await;
        let entry = map.entry(source_key.to_string()).or_default();
        let permits = entry
            .permits
            .get_or_insert_with(|| Arc::new(Semaphore::new(self.per_source_concurrency)))
            .clone();
        if entry.pacer.is_none() {
            entry.pacer = self
                .min_intervals
                .get(source_key)
                .map(|interval| Arc::new(RequestPacer::new(*interval)));
        }
        (permits, entry.pacer.clone())
    }

    /// GET `url` on behalf of `source_key`, retrying throttling and transient failures.
    pub async fn fetch_bytes(
        &self,
        source_key: &str,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let (permits, pacer) = self.limits_for(source_key).await;
        let _permit = permits.acquire_owned().await.ok();

        let span = info_span!("http_fetch", source = source_key, url);
        self.fetch_with_retries(pacer.as_deref(), url)
            .instrument(span)
            .await
    }

    async fn fetch_with_retries(
        &self,
        pacer: Option<&RequestPacer>,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0usize;
        loop {
            if let Some(pacer) = pacer {
                pacer.wait_turn().await;
            }

            let (disposition, err) = match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }
                    let err = FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    };
                    (classify_status(status), err)
                }
                Err(err) => (classify_reqwest_error(&err), FetchError::Request(err)),
            };

            if disposition == RetryDisposition::NonRetryable || attempt >= self.backoff.max_retries {
                return Err(err);
            }
            let delay = self.backoff.delay_for_attempt(attempt);
            tracing::debug!(attempt, ?delay, error = %err, "retrying fetch");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}
