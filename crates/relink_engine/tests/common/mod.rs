#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use relink_engine::{
    ContentStore, FetchedContent, PipelineEvent, ProgressSink, RemoteObject, ResourceReference,
    ResourceType, StoreError,
};

/// Sink that records every event for later assertions.
#[derive(Default)]
pub struct CollectingSink {
    events: Arc<Mutex<Vec<PipelineEvent>>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Vec<PipelineEvent> {
        self.events.lock().unwrap().drain(..).collect()
    }

    pub fn snapshot(&self) -> Vec<PipelineEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl ProgressSink for CollectingSink {
    fn emit(&self, event: PipelineEvent) {
        self.events.lock().unwrap().push(event);
    }
}

pub fn reference(url: &str) -> ResourceReference {
    ResourceReference {
        source_text: url.to_string(),
        url: url.to_string(),
        normalized_url: url.to_lowercase(),
        resource_type: ResourceType::Pdf,
        file_extension: Some("pdf".to_string()),
        is_external: true,
        originating_elements: vec![format!("<a href=\"{url}\">doc</a>")],
        ordinal: 0,
    }
}

pub fn fetched(url: &str, filename: &str, body: &[u8], mime: &str) -> FetchedContent {
    FetchedContent {
        reference: reference(url),
        bytes: Bytes::copy_from_slice(body),
        byte_size: body.len() as u64,
        mime_type: mime.to_string(),
        suggested_filename: filename.to_string(),
        fetch_duration_ms: 1,
        fetched_at_ms: 0,
        integrity_hash: None,
    }
}

type DuplicateKey = (String, u64, String);

/// In-memory content store with failure knobs, recording every call.
#[derive(Default)]
pub struct FakeStore {
    next_id: AtomicUsize,
    /// (filename, size, mime) of every payload actually uploaded.
    pub uploads: Mutex<Vec<DuplicateKey>>,
    pub duplicate_checks: AtomicUsize,
    /// Pre-seeded records returned by `find_duplicate`.
    pub seeded: Mutex<HashMap<DuplicateKey, RemoteObject>>,
    /// filename -> number of Unavailable failures before an upload succeeds.
    pub flaky_uploads: Mutex<HashMap<String, u32>>,
    /// filenames whose upload is rejected outright.
    pub rejected: Mutex<Vec<String>>,
    pub fail_duplicate_check: AtomicBool,
    pub fail_resolve: AtomicBool,
}

impl FakeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_duplicate(&self, filename: &str, size: u64, mime: &str, object: RemoteObject) {
        self.seeded
            .lock()
            .unwrap()
            .insert((filename.to_string(), size, mime.to_string()), object);
    }

    pub fn make_flaky(&self, filename: &str, failures: u32) {
        self.flaky_uploads
            .lock()
            .unwrap()
            .insert(filename.to_string(), failures);
    }

    pub fn reject(&self, filename: &str) {
        self.rejected.lock().unwrap().push(filename.to_string());
    }

    pub fn upload_count(&self) -> usize {
        self.uploads.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl ContentStore for FakeStore {
    async fn upload(
        &self,
        bytes: Bytes,
        filename: &str,
        mime_type: &str,
    ) -> Result<RemoteObject, StoreError> {
        if self.rejected.lock().unwrap().iter().any(|f| f == filename) {
            return Err(StoreError::Rejected(format!("{filename} refused")));
        }
        {
            let mut flaky = self.flaky_uploads.lock().unwrap();
            if let Some(remaining) = flaky.get_mut(filename) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(StoreError::Unavailable("store briefly down".to_string()));
                }
            }
        }
        let id = format!("obj-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.uploads.lock().unwrap().push((
            filename.to_string(),
            bytes.len() as u64,
            mime_type.to_string(),
        ));
        Ok(RemoteObject {
            remote_id: id,
            size: bytes.len() as u64,
            mime_type: mime_type.to_string(),
            public_url: None,
            thumbnail_url: None,
        })
    }

    async fn find_duplicate(
        &self,
        filename: &str,
        size: u64,
        mime_type: &str,
    ) -> Result<Option<RemoteObject>, StoreError> {
        self.duplicate_checks.fetch_add(1, Ordering::SeqCst);
        if self.fail_duplicate_check.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("duplicate index offline".to_string()));
        }
        let key = (filename.to_string(), size, mime_type.to_string());
        Ok(self.seeded.lock().unwrap().get(&key).cloned())
    }

    async fn resolve_public_url(&self, remote_id: &str) -> Result<String, StoreError> {
        if self.fail_resolve.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("resolver offline".to_string()));
        }
        Ok(format!("https://store.example.com/public/{remote_id}"))
    }
}
