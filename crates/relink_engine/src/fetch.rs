use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::{stream, StreamExt};
use reqwest::header::CONTENT_TYPE;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::filename::suggested_filename;
use crate::retry::RetryPolicy;
use crate::types::{
    epoch_ms, BatchProgress, FailureKind, FetchError, FetchedContent, PipelineEvent,
    ProcessingStage, ProgressSink, ResourceReference,
};

pub const DEFAULT_MAX_FILE_SIZE: u64 = 50_000_000;

#[derive(Debug, Clone)]
pub struct FetchSettings {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub redirect_limit: usize,
    pub max_bytes: u64,
    pub concurrency: usize,
    pub retry: RetryPolicy,
    pub compute_digest: bool,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            redirect_limit: 5,
            max_bytes: DEFAULT_MAX_FILE_SIZE,
            concurrency: 3,
            retry: RetryPolicy::default(),
            compute_digest: false,
        }
    }
}

#[async_trait::async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, reference: &ResourceReference) -> Result<FetchedContent, FetchError>;
}

#[derive(Debug, Clone)]
pub struct ReqwestFetcher {
    settings: FetchSettings,
}

impl ReqwestFetcher {
    pub fn new(settings: FetchSettings) -> Self {
        Self { settings }
    }

    fn build_client(&self) -> Result<reqwest::Client, FetchError> {
        reqwest::Client::builder()
            .connect_timeout(self.settings.connect_timeout)
            .timeout(self.settings.request_timeout)
            .redirect(reqwest::redirect::Policy::limited(self.settings.redirect_limit))
            .build()
            .map_err(|err| FetchError::new(FailureKind::Network, err.to_string()))
    }
}

#[async_trait::async_trait]
impl Fetcher for ReqwestFetcher {
    async fn fetch(&self, reference: &ResourceReference) -> Result<FetchedContent, FetchError> {
        let started = Instant::now();
        let parsed = Url::parse(&reference.url)
            .map_err(|err| FetchError::new(FailureKind::InvalidUrl, err.to_string()))?;
        let client = self.build_client()?;

        let response = client.get(parsed).send().await.map_err(map_reqwest_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::new(
                FailureKind::HttpStatus(status.as_u16()),
                status.to_string(),
            ));
        }

        if let Some(content_len) = response.content_length() {
            if content_len > self.settings.max_bytes {
                return Err(FetchError::new(
                    FailureKind::TooLarge {
                        max_bytes: self.settings.max_bytes,
                        actual: Some(content_len),
                    },
                    "response too large",
                ));
            }
        }

        let final_url = response.url().clone();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.split(';').next().unwrap_or(value).trim().to_string())
            .filter(|value| !value.is_empty());

        let mut body = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(map_reqwest_error)?;
            let next_len = body.len() as u64 + chunk.len() as u64;
            if next_len > self.settings.max_bytes {
                return Err(FetchError::new(
                    FailureKind::TooLarge {
                        max_bytes: self.settings.max_bytes,
                        actual: Some(next_len),
                    },
                    "response too large",
                ));
            }
            body.extend_from_slice(&chunk);
        }

        let mime_type = content_type
            .or_else(|| {
                reference
                    .file_extension
                    .as_deref()
                    .and_then(crate::filename::mime_for_extension)
                    .map(str::to_string)
            })
            .unwrap_or_else(|| "application/octet-stream".to_string());

        let integrity_hash = self.settings.compute_digest.then(|| hex_digest(&body));

        Ok(FetchedContent {
            reference: reference.clone(),
            byte_size: body.len() as u64,
            bytes: Bytes::from(body),
            mime_type,
            suggested_filename: suggested_filename(&final_url, reference.file_extension.as_deref()),
            fetch_duration_ms: started.elapsed().as_millis() as u64,
            fetched_at_ms: epoch_ms(),
            integrity_hash,
        })
    }
}

fn map_reqwest_error(err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        return FetchError::new(FailureKind::Timeout, err.to_string());
    }
    if err.is_redirect() {
        return FetchError::new(FailureKind::RedirectLimitExceeded, err.to_string());
    }
    FetchError::new(FailureKind::Network, err.to_string())
}

fn hex_digest(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(64);
    for byte in digest.iter() {
        use std::fmt::Write;
        let _ = write!(&mut hex, "{byte:02x}");
    }
    hex
}

/// A reference the fetcher gave up on, with the retry count it spent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchFailure {
    pub reference: ResourceReference,
    pub error: FetchError,
    pub status_code: Option<u16>,
    pub retry_attempts: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchBatch {
    pub fetched: Vec<FetchedContent>,
    pub failures: Vec<FetchFailure>,
}

impl FetchBatch {
    pub fn bytes_downloaded(&self) -> u64 {
        self.fetched.iter().map(|c| c.byte_size).sum()
    }
}

/// Downloads every reference through a bounded worker pool.
///
/// Workers never share a reference; completion order is unspecified.
/// Retryable failures back off per `settings.retry`, racing the cancellation
/// token. A progress event is emitted after each completion.
pub async fn fetch_all(
    fetcher: &dyn Fetcher,
    references: &[ResourceReference],
    settings: &FetchSettings,
    cancel: &CancellationToken,
    sink: &dyn ProgressSink,
) -> FetchBatch {
    let total = references.len();
    let mut batch = FetchBatch::default();
    let mut bytes: u64 = 0;

    let mut results = stream::iter(references)
        .map(|reference| async move {
            let outcome = fetch_with_retry(fetcher, reference, &settings.retry, cancel).await;
            (reference, outcome)
        })
        .buffer_unordered(settings.concurrency.max(1));

    while let Some((reference, outcome)) = results.next().await {
        match outcome {
            Ok(content) => {
                bytes += content.byte_size;
                log::debug!(
                    "fetched {} ({} bytes, {} ms)",
                    reference.url,
                    content.byte_size,
                    content.fetch_duration_ms
                );
                batch.fetched.push(content);
            }
            Err((error, retry_attempts)) => {
                log::debug!(
                    "fetch failed for {} after {} retries: {}",
                    reference.url,
                    retry_attempts,
                    error
                );
                batch.failures.push(FetchFailure {
                    reference: reference.clone(),
                    status_code: error.kind.status_code(),
                    error,
                    retry_attempts,
                });
            }
        }
        sink.emit(PipelineEvent::Progress(BatchProgress {
            stage: ProcessingStage::Downloading,
            completed: batch.fetched.len(),
            failed: batch.failures.len(),
            total,
            bytes,
        }));
    }

    batch
}

async fn fetch_with_retry(
    fetcher: &dyn Fetcher,
    reference: &ResourceReference,
    retry: &RetryPolicy,
    cancel: &CancellationToken,
) -> Result<FetchedContent, (FetchError, u32)> {
    let mut retries = 0u32;
    loop {
        let attempt = tokio::select! {
            _ = cancel.cancelled() => {
                return Err((FetchError::new(FailureKind::Cancelled, "fetch cancelled"), retries));
            }
            result = fetcher.fetch(reference) => result,
        };
        match attempt {
            Ok(content) => return Ok(content),
            Err(error) if error.kind.is_retryable() && retry.allows(retries) => {
                let delay = retry.next_delay(retries);
                retries += 1;
                log::debug!(
                    "retrying {} in {:?} (retry {retries}): {error}",
                    reference.url,
                    delay
                );
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return Err((
                            FetchError::new(FailureKind::Cancelled, "fetch cancelled"),
                            retries,
                        ));
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(error) => return Err((error, retries)),
        }
    }
}
