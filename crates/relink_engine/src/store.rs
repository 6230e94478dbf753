use std::time::Duration;

use bytes::Bytes;
use futures_util::{stream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::retry::RetryPolicy;
use crate::types::{
    epoch_ms, BatchProgress, FetchedContent, PipelineEvent, ProcessingStage, ProgressSink,
    StoredRecord, UrlMapping,
};

/// Identity of an object held by the content store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteObject {
    pub remote_id: String,
    pub size: u64,
    pub mime_type: String,
    pub public_url: Option<String>,
    pub thumbnail_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Terminal: the store refused the request and a retry would not help.
    #[error("store rejected the request: {0}")]
    Rejected(String),
    /// Retryable: the store could not be reached or answered 5xx.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// Retryable: the store is shedding load.
    #[error("store rate limited: {0}")]
    RateLimited(String),
    /// Retryable: the call outlived the configured upload timeout.
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),
    /// Terminal: rejected client-side before any store call.
    #[error("content too large (max {max_bytes}, actual {actual})")]
    TooLarge { max_bytes: u64, actual: u64 },
    #[error("upload cancelled")]
    Cancelled,
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::Unavailable(_) | StoreError::RateLimited(_) | StoreError::Timeout(_)
        )
    }
}

/// The content store as an injected capability.
///
/// The pipeline only ever needs these three calls; expressing them as a
/// trait keeps every stage substitutable in tests.
#[async_trait::async_trait]
pub trait ContentStore: Send + Sync {
    async fn upload(
        &self,
        bytes: Bytes,
        filename: &str,
        mime_type: &str,
    ) -> Result<RemoteObject, StoreError>;

    async fn find_duplicate(
        &self,
        filename: &str,
        size: u64,
        mime_type: &str,
    ) -> Result<Option<RemoteObject>, StoreError>;

    async fn resolve_public_url(&self, remote_id: &str) -> Result<String, StoreError>;
}

#[derive(Debug, Clone)]
pub struct UploadSettings {
    pub concurrency: usize,
    pub retry: RetryPolicy,
    pub check_duplicates: bool,
    pub max_bytes: u64,
    pub timeout: Duration,
    pub continue_on_error: bool,
    /// Deterministic public URL fallback; `{id}` expands to the remote id.
    pub url_template: String,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            concurrency: 2,
            retry: RetryPolicy::default(),
            check_duplicates: true,
            max_bytes: crate::fetch::DEFAULT_MAX_FILE_SIZE,
            timeout: Duration::from_secs(60),
            continue_on_error: true,
            url_template: "/content/{id}".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadFailure {
    pub reference: crate::types::ResourceReference,
    pub error: StoreError,
    pub retry_attempts: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadBatch {
    pub stored: Vec<StoredRecord>,
    pub failures: Vec<UploadFailure>,
    /// Bytes actually sent; duplicate hits transfer nothing.
    pub bytes_uploaded: u64,
}

impl UploadBatch {
    pub fn duplicates(&self) -> usize {
        self.stored.iter().filter(|r| r.was_duplicate).count()
    }

    /// Mapping of successful uploads only.
    pub fn url_mapping(&self) -> UrlMapping {
        self.stored
            .iter()
            .map(|r| (r.reference.normalized_url.clone(), r.public_url.clone()))
            .collect()
    }
}

/// Uploads every fetched payload through a bounded worker pool.
///
/// Per-item failures are isolated unless `continue_on_error` is off, in
/// which case the first failure stops the batch (in-flight work is dropped).
/// Exactly one result is produced per processed item.
pub async fn upload_all(
    store: &dyn ContentStore,
    items: &[FetchedContent],
    settings: &UploadSettings,
    cancel: &CancellationToken,
    sink: &dyn ProgressSink,
) -> UploadBatch {
    let total = items.len();
    let mut batch = UploadBatch::default();

    let mut results = stream::iter(items)
        .map(|item| async move {
            let outcome = upload_one(store, item, settings, cancel).await;
            (item, outcome)
        })
        .buffer_unordered(settings.concurrency.max(1));

    while let Some((item, outcome)) = results.next().await {
        let halt = match outcome {
            Ok(record) => {
                if !record.was_duplicate {
                    batch.bytes_uploaded += item.byte_size;
                }
                log::debug!(
                    "stored {} as {} (duplicate: {})",
                    item.suggested_filename,
                    record.remote_id,
                    record.was_duplicate
                );
                batch.stored.push(record);
                false
            }
            Err((error, retry_attempts)) => {
                log::debug!(
                    "upload failed for {} after {} retries: {}",
                    item.suggested_filename,
                    retry_attempts,
                    error
                );
                batch.failures.push(UploadFailure {
                    reference: item.reference.clone(),
                    error,
                    retry_attempts,
                });
                !settings.continue_on_error
            }
        };
        sink.emit(PipelineEvent::Progress(BatchProgress {
            stage: ProcessingStage::Uploading,
            completed: batch.stored.len(),
            failed: batch.failures.len(),
            total,
            bytes: batch.bytes_uploaded,
        }));
        if halt {
            break;
        }
    }

    batch
}

async fn upload_one(
    store: &dyn ContentStore,
    item: &FetchedContent,
    settings: &UploadSettings,
    cancel: &CancellationToken,
) -> Result<StoredRecord, (StoreError, u32)> {
    if item.byte_size > settings.max_bytes {
        return Err((
            StoreError::TooLarge {
                max_bytes: settings.max_bytes,
                actual: item.byte_size,
            },
            0,
        ));
    }

    if settings.check_duplicates {
        // The duplicate check is not retried; a transient failure here falls
        // through to a fresh upload.
        match store
            .find_duplicate(&item.suggested_filename, item.byte_size, &item.mime_type)
            .await
        {
            Ok(Some(existing)) => {
                let public_url = match existing.public_url.clone() {
                    Some(url) => url,
                    None => resolve_or_template(store, &existing.remote_id, settings).await,
                };
                return Ok(StoredRecord {
                    reference: item.reference.clone(),
                    remote_id: existing.remote_id,
                    public_url,
                    thumbnail_url: existing.thumbnail_url,
                    was_duplicate: true,
                    uploaded_at_ms: epoch_ms(),
                });
            }
            Ok(None) => {}
            Err(err) => {
                log::warn!(
                    "duplicate check failed for {}: {err}",
                    item.suggested_filename
                );
            }
        }
    }

    let mut retries = 0u32;
    let object = loop {
        let attempt = tokio::select! {
            _ = cancel.cancelled() => return Err((StoreError::Cancelled, retries)),
            result = tokio::time::timeout(
                settings.timeout,
                store.upload(item.bytes.clone(), &item.suggested_filename, &item.mime_type),
            ) => match result {
                Ok(inner) => inner,
                Err(_) => Err(StoreError::Timeout(settings.timeout)),
            },
        };
        match attempt {
            Ok(object) => break object,
            Err(error) if error.is_retryable() && settings.retry.allows(retries) => {
                let delay = settings.retry.next_delay(retries);
                retries += 1;
                log::debug!(
                    "retrying upload of {} in {:?} (retry {retries}): {error}",
                    item.suggested_filename,
                    delay
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err((StoreError::Cancelled, retries)),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(error) => return Err((error, retries)),
        }
    };

    let public_url = match object.public_url.clone() {
        Some(url) => url,
        None => resolve_or_template(store, &object.remote_id, settings).await,
    };

    Ok(StoredRecord {
        reference: item.reference.clone(),
        remote_id: object.remote_id,
        public_url,
        thumbnail_url: object.thumbnail_url,
        was_duplicate: false,
        uploaded_at_ms: epoch_ms(),
    })
}

async fn resolve_or_template(
    store: &dyn ContentStore,
    remote_id: &str,
    settings: &UploadSettings,
) -> String {
    match store.resolve_public_url(remote_id).await {
        Ok(url) => url,
        Err(err) => {
            log::warn!("public url resolution failed for {remote_id}, using template: {err}");
            settings.url_template.replace("{id}", remote_id)
        }
    }
}
