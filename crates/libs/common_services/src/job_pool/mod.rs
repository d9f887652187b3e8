//! The shared, durable backlog of work.
//!
//! All mutation of job rows goes through [`JobPool`]. Claims are leases: a worker owns a
//! claimed row until `claimed_at + timeout_seconds`, after which any worker may take it over.

mod error;
mod memory;
mod postgres;
mod retry;

pub use error::*;
pub use memory::*;
pub use postgres::*;
pub use retry::*;

use app_state::PoolSettings;
use async_trait::async_trait;
use bon::Builder;
use chrono::{DateTime, Utc};
use common_types::{JobItem, JobPayload, JobStatus, JobType, StatusCounts, WorkerLease};

/// A job to be inserted in `pending`.
#[derive(Debug, Clone, PartialEq, Eq, Builder)]
pub struct NewJob {
    #[builder(start_fn)]
    pub payload: JobPayload,
    #[builder(into)]
    pub source_machine: String,
    /// Falls back to the job type's default priority.
    pub priority: Option<i32>,
    pub timeout_seconds: i32,
    pub max_attempts: i32,
}

impl NewJob {
    #[must_use]
    pub fn job_type(&self) -> JobType {
        self.payload.job_type()
    }

    #[must_use]
    pub fn priority(&self) -> i32 {
        self.priority.unwrap_or_else(|| self.job_type().default_priority())
    }

    #[must_use]
    pub fn dedupe_key(&self) -> String {
        self.payload.dedupe_key()
    }
}

/// Pool-wide defaults for jobs submitted by this machine.
#[derive(Debug, Clone)]
pub struct JobDefaults {
    pub source_machine: String,
    pub timeout_seconds: i32,
    pub max_attempts: i32,
}

impl JobDefaults {
    #[must_use]
    pub fn new(settings: &PoolSettings, source_machine: impl Into<String>) -> Self {
        Self {
            source_machine: source_machine.into(),
            timeout_seconds: settings.default_timeout_seconds,
            max_attempts: settings.max_attempts,
        }
    }

    #[must_use]
    pub fn job(&self, payload: impl Into<JobPayload>) -> NewJob {
        NewJob::builder(payload.into())
            .source_machine(self.source_machine.clone())
            .timeout_seconds(self.timeout_seconds)
            .max_attempts(self.max_attempts)
            .build()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Completed,
    /// The same lease already completed this job.
    AlreadyDone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Back in `pending`, claimable from `available_at` on.
    Retrying { available_at: DateTime<Utc> },
    /// Permanently failed; never claimed again unless reset.
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequeueReport {
    pub requeued: u64,
    /// Expired claims that had no attempts left.
    pub failed: u64,
}

#[async_trait]
pub trait JobPool: Send + Sync {
    /// Inserts one job and returns its id. Submitting an already known
    /// `(job_type, dedupe_key)` returns the existing id.
    async fn submit(&self, job: NewJob) -> Result<i64, PoolError>;

    /// Bulk insert. Returns how many rows were new.
    async fn submit_many(&self, jobs: Vec<NewJob>) -> Result<u64, PoolError>;

    /// Atomically claims up to `batch_size` claimable jobs of the given types, in
    /// `priority DESC, id ASC` order. Concurrent callers always receive disjoint sets.
    async fn claim_batch(
        &self,
        job_types: &[JobType],
        machine_id: &str,
        batch_size: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobItem>, PoolError>;

    /// Marks the job done. Fails with [`PoolError::StaleClaim`] when the lease no longer holds the row.
    async fn complete(&self, lease: &WorkerLease) -> Result<Completion, PoolError>;

    /// Reports a failed attempt. Non-permanent failures go back to `pending` unless the
    /// retry ceiling is reached, in which case the job is failed permanently.
    async fn fail(
        &self,
        lease: &WorkerLease,
        permanent: bool,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<FailOutcome, PoolError>;

    /// Returns expired claims to `pending` (or `failed` when out of attempts).
    async fn requeue_expired(&self, now: DateTime<Utc>) -> Result<RequeueReport, PoolError>;

    async fn status_counts(
        &self,
        job_type: Option<JobType>,
        now: DateTime<Utc>,
    ) -> Result<StatusCounts, PoolError>;

    /// Moves permanently failed jobs back to `pending` with a fresh attempt budget.
    async fn reset_failed(&self, job_type: Option<JobType>) -> Result<u64, PoolError>;

    /// Keyset-paged listing: rows with `id > after_id`, ascending, at most `limit`.
    async fn list_items(
        &self,
        job_type: JobType,
        status: JobStatus,
        after_id: i64,
        limit: u32,
    ) -> Result<Vec<JobItem>, PoolError>;

    /// Returns `done` jobs to `pending` with a fresh attempt budget.
    async fn revert_to_pending(&self, ids: &[i64], reason: &str) -> Result<u64, PoolError>;

    /// Records jobs as `done`, inserting them if unknown. Rows under a live claim are left alone.
    async fn backfill_done(&self, jobs: Vec<NewJob>, now: DateTime<Utc>) -> Result<u64, PoolError>;
}
