//! Durable job records with compare-and-swap updates.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use warden_core::{Expected, Job, JobId, JobState};

/// How `put` treats an existing record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutMode {
    /// Fail with `AlreadyExists` if the id is taken.
    CreateOnly,
    /// Replace unconditionally (administrative repair).
    Overwrite,
}

/// Which jobs a scan yields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanKind {
    /// Non-terminal jobs whose deadline is at or before `now`.
    DeadlineExpired { now: DateTime<Utc> },
    /// Completed/Failed jobs last transitioned at or before `settled_before`.
    AwaitingReclaim { settled_before: DateTime<Utc> },
}

impl ScanKind {
    pub fn matches(&self, job: &Job) -> bool {
        match *self {
            ScanKind::DeadlineExpired { now } => job.is_overdue(now),
            ScanKind::AwaitingReclaim { settled_before } => {
                job.state.awaits_reclaim() && job.last_transition_at <= settled_before
            }
        }
    }
}

/// One page of a scan, ordered by job id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanPage {
    pub ids: Vec<JobId>,
    /// Resume point; `None` once the scan is exhausted.
    pub next: Option<JobId>,
}

/// Job store abstraction.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a record. Returns the stored record (with its revision).
    async fn put(&self, job: Job, mode: PutMode) -> Result<Job, JobStoreError>;

    async fn get(&self, id: JobId) -> Result<Job, JobStoreError>;

    /// Replace the record only if its current state and revision match
    /// `expected`. The stored revision is `expected.revision + 1`.
    async fn compare_and_swap(
        &self,
        id: JobId,
        expected: Expected,
        new: Job,
    ) -> Result<Job, JobStoreError>;

    /// Up to `limit` matching ids strictly after `after`, in id order.
    async fn scan(
        &self,
        kind: ScanKind,
        after: Option<JobId>,
        limit: usize,
    ) -> Result<ScanPage, JobStoreError>;

    /// Most recent jobs first, optionally filtered by state.
    async fn list(&self, state: Option<JobState>, limit: usize) -> Result<Vec<Job>, JobStoreError>;
}

#[async_trait]
impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    async fn put(&self, job: Job, mode: PutMode) -> Result<Job, JobStoreError> {
        (**self).put(job, mode).await
    }

    async fn get(&self, id: JobId) -> Result<Job, JobStoreError> {
        (**self).get(id).await
    }

    async fn compare_and_swap(
        &self,
        id: JobId,
        expected: Expected,
        new: Job,
    ) -> Result<Job, JobStoreError> {
        (**self).compare_and_swap(id, expected, new).await
    }

    async fn scan(
        &self,
        kind: ScanKind,
        after: Option<JobId>,
        limit: usize,
    ) -> Result<ScanPage, JobStoreError> {
        (**self).scan(kind, after, limit).await
    }

    async fn list(&self, state: Option<JobState>, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        (**self).list(state, limit).await
    }
}

/// Job store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("compare-and-swap conflict on job {id}: {reason}")]
    Conflict { id: JobId, reason: String },
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("storage error: {0}")]
    Storage(String),
}

impl JobStoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            JobStoreError::Conflict { .. } | JobStoreError::AlreadyExists(_)
        )
    }
}

/// Lazy, restartable walk over a scan, one page at a time.
///
/// Interrupting a walk and starting a new one from `cursor()` yields the
/// remaining ids without repeating the ones already seen.
pub struct JobScan<'a, S: ?Sized> {
    store: &'a S,
    kind: ScanKind,
    cursor: Option<JobId>,
    page_size: usize,
    exhausted: bool,
}

impl<'a, S> JobScan<'a, S>
where
    S: JobStore + ?Sized,
{
    pub fn new(store: &'a S, kind: ScanKind, page_size: usize) -> Self {
        Self {
            store,
            kind,
            cursor: None,
            page_size: page_size.max(1),
            exhausted: false,
        }
    }

    pub fn resume_from(mut self, cursor: Option<JobId>) -> Self {
        self.cursor = cursor;
        self
    }

    /// Last id yielded so far.
    pub fn cursor(&self) -> Option<JobId> {
        self.cursor
    }

    pub async fn next_page(&mut self) -> Result<Option<Vec<JobId>>, JobStoreError> {
        if self.exhausted {
            return Ok(None);
        }

        let page = self.store.scan(self.kind, self.cursor, self.page_size).await?;
        if let Some(last) = page.ids.last() {
            self.cursor = Some(*last);
        }
        if page.next.is_none() {
            self.exhausted = true;
        }

        if page.ids.is_empty() {
            Ok(None)
        } else {
            Ok(Some(page.ids))
        }
    }
}

/// Non-terminal jobs whose deadline has passed at `now`.
pub fn scan_deadline_expired<S>(store: &S, now: DateTime<Utc>, page_size: usize) -> JobScan<'_, S>
where
    S: JobStore + ?Sized,
{
    JobScan::new(store, ScanKind::DeadlineExpired { now }, page_size)
}

/// Completed/Failed jobs whose compute unit still has to be reclaimed.
pub fn scan_awaiting_reclaim<S>(
    store: &S,
    settled_before: DateTime<Utc>,
    page_size: usize,
) -> JobScan<'_, S>
where
    S: JobStore + ?Sized,
{
    JobScan::new(store, ScanKind::AwaitingReclaim { settled_before }, page_size)
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<BTreeMap<JobId, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn len(&self) -> usize {
        self.jobs.read().map(|jobs| jobs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned<T>(_: T) -> JobStoreError {
    JobStoreError::Storage("job store lock poisoned".to_string())
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn put(&self, mut job: Job, mode: PutMode) -> Result<Job, JobStoreError> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;

        match (jobs.get(&job.id), mode) {
            (Some(_), PutMode::CreateOnly) => return Err(JobStoreError::AlreadyExists(job.id)),
            (Some(existing), PutMode::Overwrite) => job.revision = existing.revision + 1,
            (None, _) => job.revision = 0,
        }

        jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get(&self, id: JobId) -> Result<Job, JobStoreError> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        jobs.get(&id).cloned().ok_or(JobStoreError::NotFound(id))
    }

    async fn compare_and_swap(
        &self,
        id: JobId,
        expected: Expected,
        mut new: Job,
    ) -> Result<Job, JobStoreError> {
        if new.id != id {
            return Err(JobStoreError::Storage(format!(
                "record for job {} cannot replace job {id}",
                new.id
            )));
        }

        let mut jobs = self.jobs.write().map_err(poisoned)?;
        let current = jobs.get(&id).ok_or(JobStoreError::NotFound(id))?;

        expected.check(current).map_err(|e| JobStoreError::Conflict {
            id,
            reason: e.to_string(),
        })?;

        new.revision = expected.revision + 1;
        jobs.insert(id, new.clone());
        Ok(new)
    }

    async fn scan(
        &self,
        kind: ScanKind,
        after: Option<JobId>,
        limit: usize,
    ) -> Result<ScanPage, JobStoreError> {
        use std::ops::Bound;

        let jobs = self.jobs.read().map_err(poisoned)?;
        let lower = match after {
            Some(id) => Bound::Excluded(id),
            None => Bound::Unbounded,
        };

        let ids: Vec<JobId> = jobs
            .range((lower, Bound::Unbounded))
            .filter(|(_, job)| kind.matches(job))
            .map(|(id, _)| *id)
            .take(limit)
            .collect();

        let next = if limit > 0 && ids.len() == limit {
            ids.last().copied()
        } else {
            None
        };

        Ok(ScanPage { ids, next })
    }

    async fn list(&self, state: Option<JobState>, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        // uuid v7 ids sort by creation time
        Ok(jobs
            .values()
            .rev()
            .filter(|job| state.is_none_or(|s| job.state == s))
            .take(limit)
            .cloned()
            .collect())
    }
}
