use crate::job_pool::{
    Completion, FailOutcome, JobPool, NewJob, PoolError, RequeueReport, RetryPolicy,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common_types::{JobItem, JobStatus, JobType, StatusCounts, WorkerLease};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

/// In-process job pool with the same semantics as [`crate::job_pool::PgJobPool`].
///
/// Every operation runs under one lock, which makes each of them atomic the way a single
/// SQL statement is. Used for tests and single-machine dry runs.
#[derive(Debug, Default)]
pub struct MemoryJobPool {
    state: Mutex<MemoryState>,
    retry: RetryPolicy,
}

#[derive(Debug, Default)]
struct MemoryState {
    last_id: i64,
    jobs: BTreeMap<i64, JobItem>,
    keys: HashMap<(JobType, String), i64>,
}

impl MemoryState {
    fn insert(&mut self, job: &NewJob, status: JobStatus, now: DateTime<Utc>) -> Result<i64, PoolError> {
        let key = (job.job_type(), job.dedupe_key());
        if let Some(id) = self.keys.get(&key) {
            return Ok(*id);
        }
        self.last_id += 1;
        let id = self.last_id;
        let item = JobItem {
            id,
            job_type: job.job_type(),
            payload: job.payload.to_value()?,
            dedupe_key: key.1.clone(),
            status,
            priority: job.priority(),
            timeout_seconds: job.timeout_seconds,
            attempts: 0,
            max_attempts: job.max_attempts,
            claimed_by: None,
            claimed_at: None,
            available_at: now,
            source_machine: job.source_machine.clone(),
            last_error: None,
            created_at: now,
            finished_at: (status == JobStatus::Done).then_some(now),
        };
        self.jobs.insert(id, item);
        self.keys.insert(key, id);
        Ok(id)
    }

    fn held_mut(&mut self, lease: &WorkerLease) -> Result<&mut JobItem, PoolError> {
        let item = self
            .jobs
            .get_mut(&lease.job_id)
            .ok_or(PoolError::NotFound(lease.job_id))?;
        if holds(item, lease) && item.status == JobStatus::Claimed {
            Ok(item)
        } else {
            Err(PoolError::StaleClaim {
                job_id: lease.job_id,
            })
        }
    }
}

fn holds(item: &JobItem, lease: &WorkerLease) -> bool {
    item.claimed_by.as_deref() == Some(lease.machine_id.as_str())
        && item.claimed_at == Some(lease.claimed_at)
}

fn claimable(item: &JobItem, job_types: &[JobType], now: DateTime<Utc>) -> bool {
    job_types.contains(&item.job_type)
        && item.attempts < item.max_attempts
        && ((item.status == JobStatus::Pending && item.available_at <= now)
            || item.lease_expired(now))
}

impl MemoryJobPool {
    #[must_use]
    pub fn new(retry: RetryPolicy) -> Self {
        Self {
            state: Mutex::default(),
            retry,
        }
    }

    fn state(&self) -> Result<MutexGuard<'_, MemoryState>, PoolError> {
        self.state
            .lock()
            .map_err(|_| PoolError::Unavailable("memory pool lock poisoned".to_owned()))
    }

    /// Snapshot of one row.
    pub fn get(&self, id: i64) -> Result<Option<JobItem>, PoolError> {
        Ok(self.state()?.jobs.get(&id).cloned())
    }
}

#[async_trait]
impl JobPool for MemoryJobPool {
    async fn submit(&self, job: NewJob) -> Result<i64, PoolError> {
        self.state()?.insert(&job, JobStatus::Pending, Utc::now())
    }

    async fn submit_many(&self, jobs: Vec<NewJob>) -> Result<u64, PoolError> {
        let mut state = self.state()?;
        let before = state.jobs.len();
        let now = Utc::now();
        for job in &jobs {
            state.insert(job, JobStatus::Pending, now)?;
        }
        Ok((state.jobs.len() - before) as u64)
    }

    async fn claim_batch(
        &self,
        job_types: &[JobType],
        machine_id: &str,
        batch_size: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobItem>, PoolError> {
        let mut state = self.state()?;
        let mut candidates: Vec<(i32, i64)> = state
            .jobs
            .values()
            .filter(|item| claimable(item, job_types, now))
            .map(|item| (item.priority, item.id))
            .collect();
        candidates.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        candidates.truncate(batch_size as usize);

        let mut claimed = Vec::with_capacity(candidates.len());
        for (_, id) in candidates {
            if let Some(item) = state.jobs.get_mut(&id) {
                item.status = JobStatus::Claimed;
                item.claimed_by = Some(machine_id.to_owned());
                item.claimed_at = Some(now);
                item.attempts += 1;
                item.finished_at = None;
                claimed.push(item.clone());
            }
        }
        Ok(claimed)
    }

    async fn complete(&self, lease: &WorkerLease) -> Result<Completion, PoolError> {
        let mut state = self.state()?;
        let item = state
            .jobs
            .get_mut(&lease.job_id)
            .ok_or(PoolError::NotFound(lease.job_id))?;
        match item.status {
            JobStatus::Claimed if holds(item, lease) => {
                item.status = JobStatus::Done;
                item.finished_at = Some(Utc::now());
                item.last_error = None;
                Ok(Completion::Completed)
            }
            JobStatus::Done if holds(item, lease) => Ok(Completion::AlreadyDone),
            _ => Err(PoolError::StaleClaim {
                job_id: lease.job_id,
            }),
        }
    }

    async fn fail(
        &self,
        lease: &WorkerLease,
        permanent: bool,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<FailOutcome, PoolError> {
        let retry = self.retry;
        let mut state = self.state()?;
        let item = state.held_mut(lease)?;

        item.claimed_by = None;
        item.claimed_at = None;
        item.last_error = Some(error.to_owned());
        if permanent || item.attempts_exhausted() {
            item.status = JobStatus::Failed;
            item.finished_at = Some(now);
            Ok(FailOutcome::Failed)
        } else {
            let available_at = now + retry.backoff(item.attempts);
            item.status = JobStatus::Pending;
            item.available_at = available_at;
            Ok(FailOutcome::Retrying { available_at })
        }
    }

    async fn requeue_expired(&self, now: DateTime<Utc>) -> Result<RequeueReport, PoolError> {
        let mut state = self.state()?;
        let mut report = RequeueReport::default();
        for item in state.jobs.values_mut().filter(|item| item.lease_expired(now)) {
            item.claimed_by = None;
            item.claimed_at = None;
            item.available_at = now;
            item.last_error = Some("lease expired".to_owned());
            if item.attempts_exhausted() {
                item.status = JobStatus::Failed;
                item.finished_at = Some(now);
                report.failed += 1;
            } else {
                item.status = JobStatus::Pending;
                report.requeued += 1;
            }
        }
        Ok(report)
    }

    async fn status_counts(
        &self,
        job_type: Option<JobType>,
        now: DateTime<Utc>,
    ) -> Result<StatusCounts, PoolError> {
        let state = self.state()?;
        let mut counts = StatusCounts::default();
        for item in state
            .jobs
            .values()
            .filter(|item| job_type.is_none_or(|t| t == item.job_type))
        {
            match item.status {
                JobStatus::Pending => counts.pending += 1,
                JobStatus::Claimed if item.lease_expired(now) => counts.expired += 1,
                JobStatus::Claimed => counts.claimed += 1,
                JobStatus::Done => counts.done += 1,
                JobStatus::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    async fn reset_failed(&self, job_type: Option<JobType>) -> Result<u64, PoolError> {
        let mut state = self.state()?;
        let now = Utc::now();
        let mut reset = 0;
        for item in state.jobs.values_mut().filter(|item| {
            item.status == JobStatus::Failed && job_type.is_none_or(|t| t == item.job_type)
        }) {
            item.status = JobStatus::Pending;
            item.attempts = 0;
            item.last_error = None;
            item.finished_at = None;
            item.available_at = now;
            reset += 1;
        }
        Ok(reset)
    }

    async fn list_items(
        &self,
        job_type: JobType,
        status: JobStatus,
        after_id: i64,
        limit: u32,
    ) -> Result<Vec<JobItem>, PoolError> {
        let state = self.state()?;
        Ok(state
            .jobs
            .range(after_id.saturating_add(1)..)
            .map(|(_, item)| item)
            .filter(|item| item.job_type == job_type && item.status == status)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn revert_to_pending(&self, ids: &[i64], reason: &str) -> Result<u64, PoolError> {
        let mut state = self.state()?;
        let now = Utc::now();
        let mut reverted = 0;
        for id in ids {
            if let Some(item) = state.jobs.get_mut(id).filter(|i| i.status == JobStatus::Done) {
                item.status = JobStatus::Pending;
                item.attempts = 0;
                item.claimed_by = None;
                item.claimed_at = None;
                item.finished_at = None;
                item.available_at = now;
                item.last_error = Some(reason.to_owned());
                reverted += 1;
            }
        }
        Ok(reverted)
    }

    async fn backfill_done(&self, jobs: Vec<NewJob>, now: DateTime<Utc>) -> Result<u64, PoolError> {
        let mut state = self.state()?;
        let mut affected = 0;
        for job in &jobs {
            let key = (job.job_type(), job.dedupe_key());
            let Some(id) = state.keys.get(&key).copied() else {
                state.insert(job, JobStatus::Done, now)?;
                affected += 1;
                continue;
            };
            let Some(item) = state.jobs.get_mut(&id) else {
                continue;
            };
            let live_claim = item.status == JobStatus::Claimed && !item.lease_expired(now);
            if item.status != JobStatus::Done && !live_claim {
                item.status = JobStatus::Done;
                item.claimed_by = None;
                item.claimed_at = None;
                item.last_error = None;
                item.finished_at = Some(now);
                affected += 1;
            }
        }
        Ok(affected)
    }
}
