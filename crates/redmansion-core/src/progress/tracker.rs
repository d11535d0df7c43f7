//! Reading progress tracking.
//!
//! The tracker keeps a local mirror of the signed-in reader's progress record
//! for the open content and issues guarded writes to the remote service:
//! at most one chapter-advanced write per chapter visit, and a best-effort
//! final-position write when the reader leaves.
//!
//! Writes are optimistic. The mirror is updated before the remote call and is
//! never rolled back, so after a failed write `local_record()` is ahead of the
//! remote record until the next successful write.
//!
//! Writes reach the remote service in the order they were issued. A detached
//! exit flush therefore lands before the next chapter's write.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, Utc};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::error::ProgressError;
use super::sampler::{percent_complete, ScrollSampler, DEFAULT_SCROLL_SAMPLE_MS};
use crate::api::{ApiResult, RemoteService};
use crate::auth::IdentitySession;
use crate::models::{ChapterMeta, ProgressPatch, ProgressRecord, ProgressWrite, ReadingStatus};
use crate::utils::Clock;

pub const MIN_RATING: u8 = 1;
pub const MAX_RATING: u8 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerConfig {
    /// Minimum time between two scroll evaluations
    pub sample_interval: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            sample_interval: Duration::milliseconds(DEFAULT_SCROLL_SAMPLE_MS),
        }
    }
}

/// Why the reader is being left.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// The reader view is being torn down (page unload, app exit)
    Teardown,
    /// The reader went to the background but may come back
    Backgrounded,
    /// The reader navigated to another page
    NavigateAway,
}

impl ExitReason {
    fn ends_visit(self) -> bool {
        matches!(self, ExitReason::Teardown | ExitReason::NavigateAway)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChapterLoadOutcome {
    /// This chapter is already loaded, or its write already ran
    AlreadyLoaded,
    /// Nobody is signed in; the visit is tracked but nothing is written
    SignedOut,
    /// The record already points at this chapter
    Unchanged,
    /// The chapter write succeeded; the resulting local record
    Written(ProgressRecord),
    /// The chapter write failed; the local record stays ahead of the remote one
    WriteFailed,
    /// The existing record could not be read, so nothing was written
    ReadFailed,
    /// A newer visit or another identity took over while this one was waiting
    Superseded,
}

/// Where to reopen a piece of content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResumePoint {
    pub chapter_number: u32,
    pub paragraph_index: usize,
    pub status: ReadingStatus,
}

impl ResumePoint {
    pub fn start() -> Self {
        Self {
            chapter_number: 1,
            paragraph_index: 0,
            status: ReadingStatus::Reading,
        }
    }
}

impl From<&ProgressRecord> for ResumePoint {
    fn from(record: &ProgressRecord) -> Self {
        Self {
            chapter_number: record.current_chapter_number,
            paragraph_index: record.current_paragraph_index,
            status: record.status,
        }
    }
}

enum Preference {
    ToggleFavorite,
    Rating(u8),
}

/// A place in the write queue. Dropping it lets the next write go.
struct WriteTicket {
    previous: Option<oneshot::Receiver<()>>,
    done: oneshot::Sender<()>,
}

impl WriteTicket {
    async fn write(self, remote: &dyn RemoteService, write: &ProgressWrite) -> ApiResult<ProgressRecord> {
        if let Some(previous) = self.previous {
            // An error only means the previous writer went away
            let _ = previous.await;
        }
        let result = remote.write_progress(write).await;
        drop(self.done);
        result
    }
}

/// One load of one chapter. Guards live here so they reset per visit.
#[derive(Debug)]
struct Visit {
    id: u64,
    content_id: String,
    chapter_write_done: bool,
    last_flushed_paragraph: Option<usize>,
}

struct TrackerState {
    owner_id: Option<String>,
    identity_generation: u64,
    mirror: Option<ProgressRecord>,
    active_content: Option<String>,
    last_loaded_chapter_id: Option<String>,
    last_written_chapter: Option<(String, u32)>,
    visit: Option<Visit>,
    next_visit_id: u64,
    sampler: ScrollSampler,
    /// Completion of the last issued write
    write_tail: Option<oneshot::Receiver<()>>,
}

impl TrackerState {
    fn new(config: TrackerConfig) -> Self {
        Self {
            owner_id: None,
            identity_generation: 0,
            mirror: None,
            active_content: None,
            last_loaded_chapter_id: None,
            last_written_chapter: None,
            visit: None,
            next_visit_id: 1,
            sampler: ScrollSampler::new(config.sample_interval),
            write_tail: None,
        }
    }

    /// Follow the identity session, discarding identity-bound state when the
    /// signed-in identity changed since the last look.
    fn sync_identity(&mut self, identity: &IdentitySession) -> Option<String> {
        let current = identity.current().map(|record| record.id);
        let generation = identity.generation();
        if current != self.owner_id || generation != self.identity_generation {
            if self.mirror.is_some() {
                debug!("Identity changed, discarding progress mirror");
            }
            self.mirror = None;
            self.last_written_chapter = None;
            self.owner_id = current;
            self.identity_generation = generation;
        }
        self.owner_id.clone()
    }

    fn owner_unchanged(&mut self, identity: &IdentitySession, owner_id: &str, generation: u64) -> bool {
        self.sync_identity(identity).as_deref() == Some(owner_id)
            && self.identity_generation == generation
    }

    fn is_current_visit(
        &mut self,
        identity: &IdentitySession,
        visit_id: u64,
        owner_id: &str,
        generation: u64,
    ) -> bool {
        self.owner_unchanged(identity, owner_id, generation)
            && self.visit.as_ref().map(|visit| visit.id) == Some(visit_id)
    }

    fn mirror_for(&self, content_id: &str) -> Option<&ProgressRecord> {
        self.mirror
            .as_ref()
            .filter(|record| record.content_id == content_id)
    }

    fn open_visit(&mut self, content_id: &str, chapter: &ChapterMeta) -> u64 {
        let id = self.next_visit_id;
        self.next_visit_id += 1;
        self.visit = Some(Visit {
            id,
            content_id: content_id.to_string(),
            chapter_write_done: false,
            last_flushed_paragraph: None,
        });
        self.active_content = Some(content_id.to_string());
        self.last_loaded_chapter_id = Some(chapter.id.clone());
        self.sampler.reset();
        id
    }

    fn end_visit(&mut self) {
        self.visit = None;
        self.last_loaded_chapter_id = None;
        self.sampler.reset();
    }

    fn next_write_ticket(&mut self) -> WriteTicket {
        let (done, finished) = oneshot::channel();
        WriteTicket {
            previous: self.write_tail.replace(finished),
            done,
        }
    }

    fn mark_chapter_written(&mut self, content_id: &str, chapter_number: u32) {
        if let Some(visit) = self.visit.as_mut() {
            visit.chapter_write_done = true;
        }
        self.last_written_chapter = Some((content_id.to_string(), chapter_number));
    }

    fn apply_optimistic(&mut self, write: &ProgressWrite, now: DateTime<Utc>) {
        let same_record = self.mirror.as_ref().is_some_and(|record| {
            record.owner_id == write.owner_id && record.content_id == write.content_id
        });
        if !same_record {
            self.mirror = Some(write.to_new_record(now));
        } else if let Some(record) = self.mirror.as_mut() {
            write.patch.apply_to(record);
        }
    }

    /// Take the server-assigned id of a record this client created.
    fn adopt_id(&mut self, saved: &ProgressRecord) {
        if let Some(record) = self.mirror.as_mut() {
            if record.owner_id == saved.owner_id
                && record.content_id == saved.content_id
                && record.id.is_none()
            {
                record.id = saved.id.clone();
            }
        }
    }

    /// The final-position write for the active visit, unless it would repeat
    /// the previous flush of this visit.
    fn take_flush(&mut self, owner_id: Option<String>, now: DateTime<Utc>) -> Option<ProgressWrite> {
        let owner_id = owner_id?;
        let paragraph = self.sampler.latest();
        let content_id = {
            let visit = self.visit.as_ref()?;
            if visit.last_flushed_paragraph == Some(paragraph) {
                debug!(paragraph = paragraph, "Position unchanged since last flush");
                return None;
            }
            visit.content_id.clone()
        };
        // Without a record the write would create one at chapter 1
        if self.mirror_for(&content_id).is_none() {
            debug!(content_id = %content_id, "No progress record to flush into");
            return None;
        }
        if let Some(visit) = self.visit.as_mut() {
            visit.last_flushed_paragraph = Some(paragraph);
        }

        let write = ProgressWrite {
            owner_id,
            content_id,
            patch: ProgressPatch {
                current_paragraph_index: Some(paragraph),
                last_read_at: Some(now),
                ..Default::default()
            },
        };
        self.apply_optimistic(&write, now);
        Some(write)
    }
}

struct Inner {
    remote: Arc<dyn RemoteService>,
    identity: IdentitySession,
    clock: Arc<dyn Clock>,
    state: Mutex<TrackerState>,
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Cheap to clone; clones share one tracker.
#[derive(Clone)]
pub struct ReadingProgressTracker {
    inner: Arc<Inner>,
}

impl ReadingProgressTracker {
    pub fn new(
        remote: Arc<dyn RemoteService>,
        identity: IdentitySession,
        clock: Arc<dyn Clock>,
        config: TrackerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                remote,
                identity,
                clock,
                state: Mutex::new(TrackerState::new(config)),
            }),
        }
    }

    /// Make `content_id` the target of favorite and rating changes without
    /// opening a chapter.
    pub fn open_content(&self, content_id: &str) {
        self.inner.lock_state().active_content = Some(content_id.to_string());
    }

    /// The local mirror of the signed-in reader's progress record.
    pub fn local_record(&self) -> Option<ProgressRecord> {
        let mut state = self.inner.lock_state();
        state.sync_identity(&self.inner.identity);
        state.mirror.clone()
    }

    pub fn latest_paragraph(&self) -> usize {
        self.inner.lock_state().sampler.latest()
    }

    pub fn is_visit_active(&self) -> bool {
        self.inner.lock_state().visit.is_some()
    }

    /// Called whenever the reader shows a chapter.
    ///
    /// Opens a new visit, then writes the chapter advance if the record points
    /// at another chapter. Repeated calls for the loaded chapter do nothing.
    pub async fn on_chapter_loaded(
        &self,
        content_id: &str,
        chapter: &ChapterMeta,
        total_chapters: u32,
    ) -> ChapterLoadOutcome {
        let (visit_id, owner_id, generation, needs_read) = {
            let mut state = self.inner.lock_state();
            let owner = state.sync_identity(&self.inner.identity);

            let same_chapter = state
                .visit
                .as_ref()
                .is_some_and(|visit| visit.content_id == content_id)
                && state.last_loaded_chapter_id.as_deref() == Some(chapter.id.as_str());
            if same_chapter {
                debug!(chapter_id = %chapter.id, "Chapter already loaded");
                return ChapterLoadOutcome::AlreadyLoaded;
            }

            let visit_id = state.open_visit(content_id, chapter);
            let Some(owner_id) = owner else {
                return ChapterLoadOutcome::SignedOut;
            };

            let marker = (content_id.to_string(), chapter.chapter_number);
            if state.last_written_chapter.as_ref() == Some(&marker)
                && state.mirror_for(content_id).is_some()
            {
                state.mark_chapter_written(content_id, chapter.chapter_number);
                return ChapterLoadOutcome::Unchanged;
            }

            let needs_read = state.mirror_for(content_id).is_none();
            (visit_id, owner_id, state.identity_generation, needs_read)
        };

        if needs_read {
            let result = self.inner.remote.read_progress(&owner_id, content_id).await;
            let mut state = self.inner.lock_state();
            if !state.is_current_visit(&self.inner.identity, visit_id, &owner_id, generation) {
                return ChapterLoadOutcome::Superseded;
            }
            match result {
                Ok(record) => {
                    if state.mirror_for(content_id).is_none() {
                        state.mirror = record;
                    }
                }
                Err(e) => {
                    // Writing blind could create a second record
                    warn!(content_id = content_id, error = %e, "Failed to read progress, skipping chapter write");
                    return ChapterLoadOutcome::ReadFailed;
                }
            }
        }

        let (write, ticket) = {
            let mut state = self.inner.lock_state();
            if !state.is_current_visit(&self.inner.identity, visit_id, &owner_id, generation) {
                return ChapterLoadOutcome::Superseded;
            }

            let number = chapter.chapter_number;
            let unchanged = state
                .mirror_for(content_id)
                .is_some_and(|record| record.current_chapter_number == number);
            if unchanged {
                state.mark_chapter_written(content_id, number);
                return ChapterLoadOutcome::Unchanged;
            }
            if state.visit.as_ref().is_some_and(|visit| visit.chapter_write_done) {
                return ChapterLoadOutcome::AlreadyLoaded;
            }
            // Set before the write is awaited so concurrent loads see it
            state.mark_chapter_written(content_id, number);

            let now = self.inner.clock.now();
            let percent = percent_complete(number, total_chapters);
            let status = if percent == 100 {
                ReadingStatus::Completed
            } else {
                ReadingStatus::Reading
            };
            let write = ProgressWrite {
                owner_id: owner_id.clone(),
                content_id: content_id.to_string(),
                patch: ProgressPatch {
                    current_chapter_number: Some(number),
                    current_paragraph_index: Some(0),
                    percent_complete: Some(percent),
                    last_read_at: Some(now),
                    status: Some(status),
                    ..Default::default()
                },
            };
            state.apply_optimistic(&write, now);
            (write, state.next_write_ticket())
        };

        debug!(
            content_id = content_id,
            chapter = chapter.chapter_number,
            "Writing chapter progress"
        );
        match ticket.write(self.inner.remote.as_ref(), &write).await {
            Ok(saved) => {
                let mut state = self.inner.lock_state();
                if !state.is_current_visit(&self.inner.identity, visit_id, &owner_id, generation) {
                    return ChapterLoadOutcome::Superseded;
                }
                state.adopt_id(&saved);
                let record = state.mirror_for(content_id).cloned().unwrap_or(saved);
                ChapterLoadOutcome::Written(record)
            }
            Err(e) => {
                warn!(content_id = content_id, error = %e, "Failed to write chapter progress");
                ChapterLoadOutcome::WriteFailed
            }
        }
    }

    /// Feed a scroll position. Returns the evaluated paragraph index, or
    /// `None` when throttled or when no visit is active.
    pub fn on_scroll_sample(&self, anchors: &[f64], scroll_top: f64) -> Option<usize> {
        let now = self.inner.clock.now();
        let mut state = self.inner.lock_state();
        if state.visit.is_none() {
            return None;
        }
        state.sampler.sample(anchors, scroll_top, now)
    }

    /// Flush the latest position in the background.
    ///
    /// Returns the write task, or `None` when there is nothing new to write.
    /// Teardown and navigation away end the visit. Outside an async runtime
    /// nothing is written and the position stays pending for a later flush.
    pub fn on_exit(&self, reason: ExitReason) -> Option<JoinHandle<()>> {
        let runtime = Handle::try_current().ok();
        let (write, ticket, handle) = {
            let mut state = self.inner.lock_state();
            let flush = match runtime {
                Some(handle) => {
                    let owner = state.sync_identity(&self.inner.identity);
                    state
                        .take_flush(owner, self.inner.clock.now())
                        .map(|write| (write, state.next_write_ticket(), handle))
                }
                None => {
                    if state.visit.is_some() {
                        warn!(reason = ?reason, "No async runtime, final position not written");
                    }
                    None
                }
            };
            if reason.ends_visit() {
                state.end_visit();
            }
            flush
        }?;

        let remote = self.inner.remote.clone();
        Some(handle.spawn(async move {
            match ticket.write(remote.as_ref(), &write).await {
                Ok(_) => debug!(
                    content_id = %write.content_id,
                    paragraph = ?write.patch.current_paragraph_index,
                    "Flushed reading position"
                ),
                Err(e) => warn!(
                    content_id = %write.content_id,
                    error = %e,
                    "Failed to flush reading position"
                ),
            }
        }))
    }

    /// Flip the favorite flag on the open content's record.
    pub async fn toggle_favorite(&self) -> Result<ProgressRecord, ProgressError> {
        self.update_preference(Preference::ToggleFavorite).await
    }

    /// Rate the open content from 1 to 5.
    pub async fn set_rating(&self, rating: u8) -> Result<ProgressRecord, ProgressError> {
        if !(MIN_RATING..=MAX_RATING).contains(&rating) {
            return Err(ProgressError::InvalidRating(rating));
        }
        self.update_preference(Preference::Rating(rating)).await
    }

    /// Read-modify-write against the mirror. A record created here starts
    /// as planned reading.
    async fn update_preference(&self, preference: Preference) -> Result<ProgressRecord, ProgressError> {
        let (owner_id, generation, content_id, needs_read) = {
            let mut state = self.inner.lock_state();
            let owner_id = state
                .sync_identity(&self.inner.identity)
                .ok_or(ProgressError::SignedOut)?;
            let content_id = state
                .active_content
                .clone()
                .ok_or(ProgressError::NoActiveContent)?;
            let needs_read = state.mirror_for(&content_id).is_none();
            (owner_id, state.identity_generation, content_id, needs_read)
        };

        if needs_read {
            let record = self.inner.remote.read_progress(&owner_id, &content_id).await?;
            let mut state = self.inner.lock_state();
            if !state.owner_unchanged(&self.inner.identity, &owner_id, generation) {
                return Err(ProgressError::SignedOut);
            }
            if state.mirror_for(&content_id).is_none() {
                state.mirror = record;
            }
        }

        let (write, local, ticket) = {
            let mut state = self.inner.lock_state();
            if !state.owner_unchanged(&self.inner.identity, &owner_id, generation) {
                return Err(ProgressError::SignedOut);
            }
            let existing = state.mirror_for(&content_id);
            let mut patch = match preference {
                Preference::ToggleFavorite => ProgressPatch {
                    is_favorite: Some(!existing.is_some_and(|record| record.is_favorite)),
                    ..Default::default()
                },
                Preference::Rating(rating) => ProgressPatch {
                    rating: Some(rating),
                    ..Default::default()
                },
            };
            if existing.is_none() {
                patch.status = Some(ReadingStatus::Planned);
            }

            let write = ProgressWrite {
                owner_id: owner_id.clone(),
                content_id: content_id.clone(),
                patch,
            };
            state.apply_optimistic(&write, self.inner.clock.now());
            let local = state.mirror_for(&content_id).cloned();
            (write, local, state.next_write_ticket())
        };

        match ticket.write(self.inner.remote.as_ref(), &write).await {
            Ok(saved) => {
                let mut state = self.inner.lock_state();
                if state.owner_unchanged(&self.inner.identity, &owner_id, generation) {
                    state.adopt_id(&saved);
                    if let Some(record) = state.mirror_for(&content_id) {
                        return Ok(record.clone());
                    }
                }
                Ok(local.unwrap_or(saved))
            }
            Err(e) => {
                warn!(content_id = %content_id, error = %e, "Failed to write progress preference");
                Ok(local.unwrap_or_else(|| write.to_new_record(self.inner.clock.now())))
            }
        }
    }

    /// Where to reopen `content_id`.
    ///
    /// When signed in and no record exists yet, one is created at the start
    /// of chapter 1. Signed-out readers always start at the beginning.
    pub async fn resume_point(&self, content_id: &str) -> Result<ResumePoint, ProgressError> {
        let (owner_id, generation) = {
            let mut state = self.inner.lock_state();
            state.active_content = Some(content_id.to_string());
            let Some(owner_id) = state.sync_identity(&self.inner.identity) else {
                return Ok(ResumePoint::start());
            };
            if let Some(record) = state.mirror_for(content_id) {
                return Ok(ResumePoint::from(record));
            }
            (owner_id, state.identity_generation)
        };

        let record = self.inner.remote.read_progress(&owner_id, content_id).await?;

        let (write, ticket) = {
            let mut state = self.inner.lock_state();
            if !state.owner_unchanged(&self.inner.identity, &owner_id, generation) {
                return Err(ProgressError::SignedOut);
            }
            if state.mirror_for(content_id).is_none() {
                state.mirror = record;
            }
            if let Some(record) = state.mirror_for(content_id) {
                return Ok(ResumePoint::from(record));
            }

            let now = self.inner.clock.now();
            let start = ResumePoint::start();
            let write = ProgressWrite {
                owner_id: owner_id.clone(),
                content_id: content_id.to_string(),
                patch: ProgressPatch {
                    current_chapter_number: Some(start.chapter_number),
                    current_paragraph_index: Some(start.paragraph_index),
                    percent_complete: Some(0),
                    last_read_at: Some(now),
                    status: Some(start.status),
                    ..Default::default()
                },
            };
            state.apply_optimistic(&write, now);
            (write, state.next_write_ticket())
        };

        match ticket.write(self.inner.remote.as_ref(), &write).await {
            Ok(saved) => {
                let mut state = self.inner.lock_state();
                if state.owner_unchanged(&self.inner.identity, &owner_id, generation) {
                    state.adopt_id(&saved);
                }
            }
            Err(e) => {
                warn!(content_id = content_id, error = %e, "Failed to create progress record");
            }
        }
        Ok(ResumePoint::start())
    }
}
