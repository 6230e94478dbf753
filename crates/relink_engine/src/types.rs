use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::rewrite::RewriteStatistics;

/// `normalized_url -> public_url`, successful uploads only.
pub type UrlMapping = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ResourceType {
    Document,
    Pdf,
    Spreadsheet,
    Presentation,
    Unknown,
}

impl ResourceType {
    pub fn label(&self) -> &'static str {
        match self {
            ResourceType::Document => "document",
            ResourceType::Pdf => "pdf",
            ResourceType::Spreadsheet => "spreadsheet",
            ResourceType::Presentation => "presentation",
            ResourceType::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A normalized, deduplicated pointer to an externally linked document
/// found in markup.
///
/// `normalized_url` is the dedup key: one reference per unique URL per
/// extraction run, no matter how many elements share it. `url` keeps the
/// resolved absolute form with its original casing and encoding, since the
/// canonical key is a match key, not a fetchable address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceReference {
    pub source_text: String,
    pub url: String,
    pub normalized_url: String,
    pub resource_type: ResourceType,
    pub file_extension: Option<String>,
    pub is_external: bool,
    pub originating_elements: Vec<String>,
    pub ordinal: usize,
}

/// Bytes pulled from an origin host. Created by the fetcher, immutable
/// afterward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedContent {
    pub reference: ResourceReference,
    pub bytes: Bytes,
    pub byte_size: u64,
    pub mime_type: String,
    pub suggested_filename: String,
    pub fetch_duration_ms: u64,
    pub fetched_at_ms: u64,
    pub integrity_hash: Option<String>,
}

/// Identity of a payload persisted on the content store. Created by the
/// uploader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    pub reference: ResourceReference,
    pub remote_id: String,
    pub public_url: String,
    pub thumbnail_url: Option<String>,
    pub was_duplicate: bool,
    pub uploaded_at_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessingStage {
    Idle,
    Parsing,
    Downloading,
    Uploading,
    Replacing,
    Complete,
    Failed,
}

impl fmt::Display for ProcessingStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProcessingStage::Idle => "idle",
            ProcessingStage::Parsing => "parsing",
            ProcessingStage::Downloading => "downloading",
            ProcessingStage::Uploading => "uploading",
            ProcessingStage::Replacing => "replacing",
            ProcessingStage::Complete => "complete",
            ProcessingStage::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Status of one resource as it crosses stage boundaries. A single entry per
/// `normalized_url` is updated across all stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceStatus {
    Pending,
    Downloading,
    Uploading,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTimings {
    pub parse_ms: u64,
    pub download_ms: u64,
    pub upload_ms: u64,
    pub replace_ms: u64,
    pub total_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStatistics {
    pub total_references: usize,
    pub downloaded: usize,
    pub uploaded: usize,
    pub duplicates: usize,
    pub failed: usize,
    pub bytes_downloaded: u64,
    pub bytes_uploaded: u64,
    pub by_type: BTreeMap<String, usize>,
    pub timings: StageTimings,
    pub rewrite: Option<RewriteStatistics>,
}

/// A per-resource failure, attributed to the stage that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceError {
    pub normalized_url: String,
    pub stage: ProcessingStage,
    pub message: String,
    pub status_code: Option<u16>,
    pub retry_attempts: u32,
}

/// Why a run settled at `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunFailure {
    /// The caller's cancellation signal fired; partial records are kept for
    /// diagnostics.
    Cancelled,
    /// A stage failure halted the run under `continue_on_error = false`.
    StageHalted { stage: ProcessingStage },
}

impl fmt::Display for RunFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunFailure::Cancelled => write!(f, "cancelled"),
            RunFailure::StageHalted { stage } => write!(f, "halted at {stage} stage"),
        }
    }
}

/// The aggregate root of one processing run. Mutated only by the
/// orchestrator; frozen once the stage reaches `Complete` or `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: u64,
    pub stage: ProcessingStage,
    pub failure: Option<RunFailure>,
    pub statuses: BTreeMap<String, ResourceStatus>,
    pub statistics: RunStatistics,
    pub errors: Vec<ResourceError>,
    pub warnings: Vec<String>,
    pub original_markup: String,
    pub final_markup: String,
    pub started_at_ms: u64,
    pub finished_at_ms: Option<u64>,
}

impl PipelineRun {
    pub fn new(id: u64, markup: &str) -> Self {
        Self {
            id,
            stage: ProcessingStage::Idle,
            failure: None,
            statuses: BTreeMap::new(),
            statistics: RunStatistics::default(),
            errors: Vec::new(),
            warnings: Vec::new(),
            original_markup: markup.to_string(),
            final_markup: markup.to_string(),
            started_at_ms: epoch_ms(),
            finished_at_ms: None,
        }
    }

    pub fn is_frozen(&self) -> bool {
        matches!(
            self.stage,
            ProcessingStage::Complete | ProcessingStage::Failed
        )
    }

    /// Serializes the run so a surrounding system can archive it.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchProgress {
    pub stage: ProcessingStage,
    pub completed: usize,
    pub failed: usize,
    pub total: usize,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineEvent {
    StageStarted {
        stage: ProcessingStage,
    },
    StageCompleted {
        stage: ProcessingStage,
        duration_ms: u64,
    },
    ResourceCompleted {
        normalized_url: String,
        stage: ProcessingStage,
    },
    ResourceFailed {
        normalized_url: String,
        stage: ProcessingStage,
        message: String,
    },
    Progress(BatchProgress),
}

pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: PipelineEvent);
}

/// Sink that forwards events to an mpsc channel, for callers polling from a
/// presentation loop.
pub struct ChannelProgressSink {
    tx: std::sync::mpsc::Sender<PipelineEvent>,
}

impl ChannelProgressSink {
    pub fn new(tx: std::sync::mpsc::Sender<PipelineEvent>) -> Self {
        Self { tx }
    }
}

impl ProgressSink for ChannelProgressSink {
    fn emit(&self, event: PipelineEvent) {
        let _ = self.tx.send(event);
    }
}

/// Sink that drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullProgressSink;

impl ProgressSink for NullProgressSink {
    fn emit(&self, _event: PipelineEvent) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchError {
    pub kind: FailureKind,
    pub message: String,
}

impl FetchError {
    pub(crate) fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for FetchError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    InvalidUrl,
    HttpStatus(u16),
    Timeout,
    RedirectLimitExceeded,
    TooLarge { max_bytes: u64, actual: Option<u64> },
    Cancelled,
    Network,
}

impl FailureKind {
    /// Retryable failures: network errors, timeouts, HTTP 5xx and 429.
    /// Everything else is terminal.
    pub fn is_retryable(&self) -> bool {
        match self {
            FailureKind::Network | FailureKind::Timeout => true,
            FailureKind::HttpStatus(429) => true,
            FailureKind::HttpStatus(code) => (500..600).contains(code),
            _ => false,
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            FailureKind::HttpStatus(code) => Some(*code),
            _ => None,
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::InvalidUrl => write!(f, "invalid url"),
            FailureKind::HttpStatus(code) => write!(f, "http status {code}"),
            FailureKind::Timeout => write!(f, "timeout"),
            FailureKind::RedirectLimitExceeded => write!(f, "redirect limit exceeded"),
            FailureKind::TooLarge { max_bytes, actual } => {
                write!(f, "response too large (max {max_bytes}, actual {actual:?})")
            }
            FailureKind::Cancelled => write!(f, "cancelled"),
            FailureKind::Network => write!(f, "network error"),
        }
    }
}

pub(crate) fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
