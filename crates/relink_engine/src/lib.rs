//! Relink engine: centralizes externally linked documents onto a managed
//! content store and rewrites the markup to point at the new copies.
mod extract;
mod fetch;
mod filename;
mod normalize;
mod pipeline;
mod retry;
mod rewrite;
mod store;
mod types;

pub use extract::{extract_references, ExtractOptions, ExtractionOutput};
pub use fetch::{
    fetch_all, FetchBatch, FetchFailure, FetchSettings, Fetcher, ReqwestFetcher,
    DEFAULT_MAX_FILE_SIZE,
};
pub use filename::{extension_from_url, mime_for_extension, suggested_filename};
pub use normalize::{is_external, normalize_for_match, resolve_candidate, Candidate, MatchOptions};
pub use pipeline::{process, Pipeline, PipelineOptions, ValidationError};
pub use retry::RetryPolicy;
pub use rewrite::{
    rewrite_links, ReplacementWarning, RewriteOutput, RewriteStatistics, WarningKind,
};
pub use store::{
    upload_all, ContentStore, RemoteObject, StoreError, UploadBatch, UploadFailure,
    UploadSettings,
};
pub use types::{
    BatchProgress, ChannelProgressSink, FailureKind, FetchError, FetchedContent, NullProgressSink,
    PipelineEvent, PipelineRun, ProcessingStage, ProgressSink, ResourceError, ResourceReference,
    ResourceStatus, ResourceType, RunFailure, RunStatistics, StageTimings, StoredRecord,
    UrlMapping,
};
