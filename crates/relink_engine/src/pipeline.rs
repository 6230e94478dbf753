use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use engine_logging::{engine_info, engine_warn};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::extract::{extract_references, ExtractOptions};
use crate::fetch::{fetch_all, FetchSettings, Fetcher, ReqwestFetcher, DEFAULT_MAX_FILE_SIZE};
use crate::normalize::MatchOptions;
use crate::retry::RetryPolicy;
use crate::rewrite::rewrite_links;
use crate::store::{upload_all, ContentStore, UploadSettings};
use crate::types::{
    epoch_ms, NullProgressSink, PipelineEvent, PipelineRun, ProcessingStage, ProgressSink,
    ResourceError, ResourceStatus, RunFailure,
};

static NEXT_RUN_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub base_url: Option<String>,
    pub external_only: bool,
    pub match_options: MatchOptions,
    pub download_concurrency: usize,
    pub upload_concurrency: usize,
    pub max_retries: u32,
    pub download_timeout: Duration,
    pub upload_timeout: Duration,
    pub redirect_limit: usize,
    pub continue_on_error: bool,
    pub check_duplicates: bool,
    pub max_file_size_bytes: u64,
    pub compute_digest: bool,
    /// Deterministic public URL fallback; `{id}` expands to the remote id.
    pub url_template: String,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            base_url: None,
            external_only: false,
            match_options: MatchOptions::default(),
            download_concurrency: 3,
            upload_concurrency: 2,
            max_retries: 3,
            download_timeout: Duration::from_secs(30),
            upload_timeout: Duration::from_secs(60),
            redirect_limit: 5,
            continue_on_error: true,
            check_duplicates: true,
            max_file_size_bytes: DEFAULT_MAX_FILE_SIZE,
            compute_digest: false,
            url_template: "/content/{id}".to_string(),
        }
    }
}

/// Bad input or options, detected before the run starts. The only error the
/// entry point surfaces directly; everything later attaches to the run.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("invalid concurrency value {value}: must be at least 1")]
    InvalidConcurrency { value: usize },
    #[error("invalid {which} timeout: must be non-zero")]
    InvalidTimeout { which: &'static str },
    #[error("invalid max file size: must be non-zero")]
    InvalidMaxFileSize,
    #[error("invalid base url {url}: {reason}")]
    InvalidBaseUrl { url: String, reason: String },
    #[error("invalid url template {template}: missing {{id}} placeholder")]
    InvalidUrlTemplate { template: String },
}

impl PipelineOptions {
    pub fn validate(&self) -> Result<(), ValidationError> {
        for value in [self.download_concurrency, self.upload_concurrency] {
            if value == 0 {
                return Err(ValidationError::InvalidConcurrency { value });
            }
        }
        if self.download_timeout.is_zero() {
            return Err(ValidationError::InvalidTimeout {
                which: "download",
            });
        }
        if self.upload_timeout.is_zero() {
            return Err(ValidationError::InvalidTimeout { which: "upload" });
        }
        if self.max_file_size_bytes == 0 {
            return Err(ValidationError::InvalidMaxFileSize);
        }
        if let Some(base) = self.base_url.as_deref() {
            Url::parse(base).map_err(|err| ValidationError::InvalidBaseUrl {
                url: base.to_string(),
                reason: err.to_string(),
            })?;
        }
        if !self.url_template.contains("{id}") {
            return Err(ValidationError::InvalidUrlTemplate {
                template: self.url_template.clone(),
            });
        }
        Ok(())
    }

    fn extract_options(&self) -> ExtractOptions {
        ExtractOptions {
            base_url: self.base_url.clone(),
            external_only: self.external_only,
            match_options: self.match_options.clone(),
        }
    }

    fn fetch_settings(&self) -> FetchSettings {
        FetchSettings {
            request_timeout: self.download_timeout,
            redirect_limit: self.redirect_limit,
            max_bytes: self.max_file_size_bytes,
            concurrency: self.download_concurrency,
            retry: RetryPolicy::with_max_retries(self.max_retries),
            compute_digest: self.compute_digest,
            ..FetchSettings::default()
        }
    }

    fn upload_settings(&self) -> UploadSettings {
        UploadSettings {
            concurrency: self.upload_concurrency,
            retry: RetryPolicy::with_max_retries(self.max_retries),
            check_duplicates: self.check_duplicates,
            max_bytes: self.max_file_size_bytes,
            timeout: self.upload_timeout,
            continue_on_error: self.continue_on_error,
            url_template: self.url_template.clone(),
        }
    }
}

/// Sequences extraction, fetch, store upload, and URL rewrite over one
/// document, threading each resource through the stages as immutable
/// hand-offs keyed by its normalized URL.
pub struct Pipeline {
    fetcher: Arc<dyn Fetcher>,
    store: Arc<dyn ContentStore>,
    options: PipelineOptions,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn ContentStore>,
        options: PipelineOptions,
    ) -> Result<Self, ValidationError> {
        options.validate()?;
        let fetcher = Arc::new(ReqwestFetcher::new(options.fetch_settings()));
        Ok(Self {
            fetcher,
            store,
            options,
        })
    }

    /// Replaces the HTTP fetcher, letting tests drive the pipeline without a
    /// network.
    pub fn with_fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    pub async fn run(&self, markup: &str) -> PipelineRun {
        self.run_with(markup, CancellationToken::new(), Arc::new(NullProgressSink))
            .await
    }

    pub async fn run_with(
        &self,
        markup: &str,
        cancel: CancellationToken,
        sink: Arc<dyn ProgressSink>,
    ) -> PipelineRun {
        let run_id = NEXT_RUN_ID.fetch_add(1, Ordering::Relaxed);
        engine_logging::set_run_id(run_id);
        let sink = sink.as_ref();
        let total_timer = Instant::now();
        let mut run = PipelineRun::new(run_id, markup);
        engine_info!("run {run_id}: processing {} bytes of markup", markup.len());

        // Parsing
        let stage_timer = self.enter_stage(&mut run, ProcessingStage::Parsing, sink);
        let extraction = extract_references(markup, &self.options.extract_options());
        run.warnings.extend(extraction.parse_errors.iter().cloned());
        for reference in &extraction.references {
            run.statuses
                .insert(reference.normalized_url.clone(), ResourceStatus::Pending);
        }
        run.statistics.total_references = extraction.references.len();
        run.statistics.by_type = extraction.type_counts();
        run.statistics.timings.parse_ms = elapsed_ms(stage_timer);
        self.complete_stage(ProcessingStage::Parsing, stage_timer, sink);
        if cancel.is_cancelled() {
            return self.settle_failed(run, RunFailure::Cancelled, total_timer, sink);
        }

        // Downloading
        let stage_timer = self.enter_stage(&mut run, ProcessingStage::Downloading, sink);
        for status in run.statuses.values_mut() {
            *status = ResourceStatus::Downloading;
        }
        let downloads = fetch_all(
            self.fetcher.as_ref(),
            &extraction.references,
            &self.options.fetch_settings(),
            &cancel,
            sink,
        )
        .await;
        for failure in &downloads.failures {
            let url = failure.reference.normalized_url.clone();
            run.statuses.insert(url.clone(), ResourceStatus::Failed);
            run.errors.push(ResourceError {
                normalized_url: url.clone(),
                stage: ProcessingStage::Downloading,
                message: failure.error.to_string(),
                status_code: failure.status_code,
                retry_attempts: failure.retry_attempts,
            });
            sink.emit(PipelineEvent::ResourceFailed {
                normalized_url: url,
                stage: ProcessingStage::Downloading,
                message: failure.error.to_string(),
            });
        }
        run.statistics.downloaded = downloads.fetched.len();
        run.statistics.failed += downloads.failures.len();
        run.statistics.bytes_downloaded = downloads.bytes_downloaded();
        run.statistics.timings.download_ms = elapsed_ms(stage_timer);
        self.complete_stage(ProcessingStage::Downloading, stage_timer, sink);
        if cancel.is_cancelled() {
            return self.settle_failed(run, RunFailure::Cancelled, total_timer, sink);
        }
        if !self.options.continue_on_error && !downloads.failures.is_empty() {
            return self.settle_failed(
                run,
                RunFailure::StageHalted {
                    stage: ProcessingStage::Downloading,
                },
                total_timer,
                sink,
            );
        }

        // Uploading
        let stage_timer = self.enter_stage(&mut run, ProcessingStage::Uploading, sink);
        for content in &downloads.fetched {
            run.statuses.insert(
                content.reference.normalized_url.clone(),
                ResourceStatus::Uploading,
            );
        }
        let uploads = upload_all(
            self.store.as_ref(),
            &downloads.fetched,
            &self.options.upload_settings(),
            &cancel,
            sink,
        )
        .await;
        for record in &uploads.stored {
            let url = record.reference.normalized_url.clone();
            run.statuses.insert(url.clone(), ResourceStatus::Completed);
            sink.emit(PipelineEvent::ResourceCompleted {
                normalized_url: url,
                stage: ProcessingStage::Uploading,
            });
        }
        for failure in &uploads.failures {
            let url = failure.reference.normalized_url.clone();
            run.statuses.insert(url.clone(), ResourceStatus::Failed);
            run.errors.push(ResourceError {
                normalized_url: url.clone(),
                stage: ProcessingStage::Uploading,
                message: failure.error.to_string(),
                status_code: None,
                retry_attempts: failure.retry_attempts,
            });
            sink.emit(PipelineEvent::ResourceFailed {
                normalized_url: url,
                stage: ProcessingStage::Uploading,
                message: failure.error.to_string(),
            });
        }
        run.statistics.uploaded = uploads.stored.len();
        run.statistics.duplicates = uploads.duplicates();
        run.statistics.failed += uploads.failures.len();
        run.statistics.bytes_uploaded = uploads.bytes_uploaded;
        run.statistics.timings.upload_ms = elapsed_ms(stage_timer);
        self.complete_stage(ProcessingStage::Uploading, stage_timer, sink);
        if cancel.is_cancelled() {
            return self.settle_failed(run, RunFailure::Cancelled, total_timer, sink);
        }
        if !self.options.continue_on_error && !uploads.failures.is_empty() {
            return self.settle_failed(
                run,
                RunFailure::StageHalted {
                    stage: ProcessingStage::Uploading,
                },
                total_timer,
                sink,
            );
        }

        // Replacing: always against the original markup, with successful
        // uploads only.
        let stage_timer = self.enter_stage(&mut run, ProcessingStage::Replacing, sink);
        let mapping = uploads.url_mapping();
        let rewritten = rewrite_links(markup, &mapping, &self.options.match_options);
        run.final_markup = rewritten.markup;
        run.warnings
            .extend(rewritten.warnings.iter().map(ToString::to_string));
        run.statistics.rewrite = Some(rewritten.statistics);
        run.statistics.timings.replace_ms = elapsed_ms(stage_timer);
        self.complete_stage(ProcessingStage::Replacing, stage_timer, sink);

        run.statistics.timings.total_ms = elapsed_ms(total_timer);
        run.stage = ProcessingStage::Complete;
        run.finished_at_ms = Some(epoch_ms());
        engine_info!(
            "run {run_id} complete: {}/{} resources relocated, {} failed",
            run.statistics.uploaded,
            run.statistics.total_references,
            run.statistics.failed
        );
        run
    }

    fn enter_stage(
        &self,
        run: &mut PipelineRun,
        stage: ProcessingStage,
        sink: &dyn ProgressSink,
    ) -> Instant {
        run.stage = stage;
        sink.emit(PipelineEvent::StageStarted { stage });
        engine_info!("run {}: stage {stage} started", run.id);
        Instant::now()
    }

    fn complete_stage(&self, stage: ProcessingStage, timer: Instant, sink: &dyn ProgressSink) {
        sink.emit(PipelineEvent::StageCompleted {
            stage,
            duration_ms: elapsed_ms(timer),
        });
    }

    /// Settles the run at `Failed`. The final markup reverts to the original
    /// input; per-resource records are preserved for diagnostics.
    fn settle_failed(
        &self,
        mut run: PipelineRun,
        failure: RunFailure,
        total_timer: Instant,
        sink: &dyn ProgressSink,
    ) -> PipelineRun {
        engine_warn!("run {}: {failure}", run.id);
        run.final_markup = run.original_markup.clone();
        run.statistics.timings.total_ms = elapsed_ms(total_timer);
        run.failure = Some(failure);
        run.stage = ProcessingStage::Failed;
        run.finished_at_ms = Some(epoch_ms());
        sink.emit(PipelineEvent::StageCompleted {
            stage: ProcessingStage::Failed,
            duration_ms: run.statistics.timings.total_ms,
        });
        run
    }
}

/// Single-call entry point: extract, fetch, upload, and rewrite `markup`
/// against the injected content store.
pub async fn process(
    markup: &str,
    store: Arc<dyn ContentStore>,
    options: PipelineOptions,
) -> Result<PipelineRun, ValidationError> {
    Ok(Pipeline::new(store, options)?.run(markup).await)
}

fn elapsed_ms(since: Instant) -> u64 {
    since.elapsed().as_millis() as u64
}
