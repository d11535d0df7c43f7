//! Test doubles shared by the unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::watch;

use crate::api::{ApiError, ApiResult, RemoteService};
use crate::cache::{MemoryStorage, SessionStorage, StorageError, StorageResult};
use crate::models::{ChapterMeta, IdentityRecord, ProgressRecord, ProgressWrite};

/// Storage whose next N writes fail with a quota error.
pub(crate) struct FlakyStorage {
    inner: MemoryStorage,
    failures_left: AtomicUsize,
    set_calls: AtomicUsize,
}

impl FlakyStorage {
    pub(crate) fn new() -> Self {
        Self {
            inner: MemoryStorage::new(),
            failures_left: AtomicUsize::new(0),
            set_calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn fail_next_writes(&self, count: usize) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    pub(crate) fn set_calls(&self) -> usize {
        self.set_calls.load(Ordering::SeqCst)
    }
}

impl SessionStorage for FlakyStorage {
    fn get_item(&self, key: &str) -> StorageResult<Option<String>> {
        self.inner.get_item(key)
    }

    fn set_item(&self, key: &str, value: &str) -> StorageResult<()> {
        self.set_calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StorageError::QuotaExceeded {
                needed: value.len(),
                available: 0,
            });
        }
        self.inner.set_item(key, value)
    }

    fn remove_item(&self, key: &str) -> StorageResult<()> {
        self.inner.remove_item(key)
    }
}

/// Holds async calls until released.
pub(crate) struct Gate {
    open: watch::Sender<bool>,
}

impl Gate {
    fn new() -> Self {
        let (open, _) = watch::channel(true);
        Self { open }
    }

    pub(crate) fn close(&self) {
        self.open.send_replace(false);
    }

    pub(crate) fn release(&self) {
        self.open.send_replace(true);
    }

    async fn pass(&self) {
        let mut rx = self.open.subscribe();
        let _ = rx.wait_for(|open| *open).await;
    }
}

/// In-memory remote service with call counters and failure switches.
pub(crate) struct FakeRemote {
    identity: Mutex<Option<IdentityRecord>>,
    chapter_lists: Mutex<HashMap<String, Vec<ChapterMeta>>>,
    progress: Mutex<HashMap<(String, String), ProgressRecord>>,
    writes: Mutex<Vec<ProgressWrite>>,
    write_failures_left: AtomicUsize,
    read_failures_left: AtomicUsize,
    identity_calls: AtomicUsize,
    chapter_calls: AtomicUsize,
    logout_calls: AtomicUsize,
    next_id: AtomicU64,
    pub(crate) identity_gate: Gate,
    pub(crate) write_gate: Gate,
    pub(crate) chapter_gate: Gate,
}

impl FakeRemote {
    pub(crate) fn new() -> Self {
        Self {
            identity: Mutex::new(None),
            chapter_lists: Mutex::new(HashMap::new()),
            progress: Mutex::new(HashMap::new()),
            writes: Mutex::new(Vec::new()),
            write_failures_left: AtomicUsize::new(0),
            read_failures_left: AtomicUsize::new(0),
            identity_calls: AtomicUsize::new(0),
            chapter_calls: AtomicUsize::new(0),
            logout_calls: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
            identity_gate: Gate::new(),
            write_gate: Gate::new(),
            chapter_gate: Gate::new(),
        }
    }

    /// `None` makes identity fetches fail with `Unauthorized`.
    pub(crate) fn set_identity(&self, identity: Option<IdentityRecord>) {
        *self.identity.lock().unwrap() = identity;
    }

    pub(crate) fn set_chapters(&self, content_id: &str, chapters: Vec<ChapterMeta>) {
        self.chapter_lists
            .lock()
            .unwrap()
            .insert(content_id.to_string(), chapters);
    }

    pub(crate) fn put_progress(&self, mut record: ProgressRecord) -> ProgressRecord {
        if record.id.is_none() {
            record.id = Some(format!("p{}", self.next_id.fetch_add(1, Ordering::SeqCst)));
        }
        self.progress.lock().unwrap().insert(
            (record.owner_id.clone(), record.content_id.clone()),
            record.clone(),
        );
        record
    }

    pub(crate) fn stored_progress(&self, owner_id: &str, content_id: &str) -> Option<ProgressRecord> {
        self.progress
            .lock()
            .unwrap()
            .get(&(owner_id.to_string(), content_id.to_string()))
            .cloned()
    }

    pub(crate) fn writes(&self) -> Vec<ProgressWrite> {
        self.writes.lock().unwrap().clone()
    }

    pub(crate) fn fail_next_writes(&self, count: usize) {
        self.write_failures_left.store(count, Ordering::SeqCst);
    }

    pub(crate) fn fail_next_reads(&self, count: usize) {
        self.read_failures_left.store(count, Ordering::SeqCst);
    }

    pub(crate) fn identity_calls(&self) -> usize {
        self.identity_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn chapter_calls(&self) -> usize {
        self.chapter_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn logout_calls(&self) -> usize {
        self.logout_calls.load(Ordering::SeqCst)
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl RemoteService for FakeRemote {
    async fn fetch_chapter_list(&self, content_id: &str) -> ApiResult<Vec<ChapterMeta>> {
        self.chapter_calls.fetch_add(1, Ordering::SeqCst);
        self.chapter_gate.pass().await;
        Ok(self
            .chapter_lists
            .lock()
            .unwrap()
            .get(content_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn fetch_identity(&self) -> ApiResult<IdentityRecord> {
        self.identity_calls.fetch_add(1, Ordering::SeqCst);
        self.identity_gate.pass().await;
        self.identity
            .lock()
            .unwrap()
            .clone()
            .ok_or(ApiError::Unauthorized)
    }

    async fn read_progress(
        &self,
        owner_id: &str,
        content_id: &str,
    ) -> ApiResult<Option<ProgressRecord>> {
        if Self::take_failure(&self.read_failures_left) {
            return Err(ApiError::ServerError("read failed".to_string()));
        }
        Ok(self.stored_progress(owner_id, content_id))
    }

    async fn write_progress(&self, write: &ProgressWrite) -> ApiResult<ProgressRecord> {
        self.writes.lock().unwrap().push(write.clone());
        self.write_gate.pass().await;

        if Self::take_failure(&self.write_failures_left) {
            return Err(ApiError::ServerError("write failed".to_string()));
        }

        let record = match self.stored_progress(&write.owner_id, &write.content_id) {
            Some(mut existing) => {
                write.patch.apply_to(&mut existing);
                existing
            }
            None => write.to_new_record(Utc::now()),
        };
        Ok(self.put_progress(record))
    }

    async fn logout(&self) -> ApiResult<()> {
        self.logout_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
