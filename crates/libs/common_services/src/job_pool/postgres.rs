use crate::job_pool::{
    Completion, FailOutcome, JobPool, NewJob, PoolError, RequeueReport, RetryPolicy,
};
use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use common_types::{JobItem, JobStatus, JobType, StatusCounts, WorkerLease};
use serde_json::Value;
use sqlx::{PgPool, Postgres, QueryBuilder};
use std::collections::HashSet;
use tracing::{debug, info, warn};

/// Rows per multi-row INSERT. Eight binds per row keeps well below the protocol's bind limit.
const INSERT_CHUNK: usize = 1000;

/// PostgreSQL-backed job pool. Claims use `FOR UPDATE SKIP LOCKED`, so concurrent
/// claimers never block on each other and never receive the same row.
#[derive(Debug, Clone)]
pub struct PgJobPool {
    pool: PgPool,
    retry: RetryPolicy,
}

impl PgJobPool {
    #[must_use]
    pub const fn new(pool: PgPool, retry: RetryPolicy) -> Self {
        Self { pool, retry }
    }

    /// Explains why a lease did not match its row.
    async fn stale_or_missing(&self, lease: &WorkerLease) -> PoolError {
        let exists: Result<Option<i64>, sqlx::Error> =
            sqlx::query_scalar("SELECT id FROM jobs WHERE id = $1")
                .bind(lease.job_id)
                .fetch_optional(&self.pool)
                .await;
        match exists {
            Ok(Some(_)) => PoolError::StaleClaim {
                job_id: lease.job_id,
            },
            Ok(None) => PoolError::NotFound(lease.job_id),
            Err(e) => e.into(),
        }
    }
}

/// Postgres stores microseconds; claim timestamps must round-trip exactly to act as fencing tokens.
fn db_time(time: DateTime<Utc>) -> DateTime<Utc> {
    time.trunc_subsecs(6)
}

fn encode_rows(jobs: &[NewJob]) -> Result<Vec<(NewJob, String, Value)>, PoolError> {
    let mut seen = HashSet::new();
    let mut rows = Vec::with_capacity(jobs.len());
    for job in jobs {
        let key = job.dedupe_key();
        // Duplicate keys inside one statement would make ON CONFLICT DO UPDATE fail.
        if seen.insert((job.job_type(), key.clone())) {
            rows.push((job.clone(), key, job.payload.to_value()?));
        }
    }
    Ok(rows)
}

#[async_trait]
impl JobPool for PgJobPool {
    async fn submit(&self, job: NewJob) -> Result<i64, PoolError> {
        let payload = job.payload.to_value()?;
        let dedupe_key = job.dedupe_key();
        let inserted: Option<i64> = sqlx::query_scalar(
            r"
            INSERT INTO jobs (job_type, payload, dedupe_key, priority, timeout_seconds, max_attempts, source_machine)
            VALUES ($1::job_type, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (job_type, dedupe_key) DO NOTHING
            RETURNING id
            ",
        )
        .bind(job.job_type().as_str())
        .bind(&payload)
        .bind(&dedupe_key)
        .bind(job.priority())
        .bind(job.timeout_seconds)
        .bind(job.max_attempts)
        .bind(&job.source_machine)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(id) = inserted {
            debug!("Submitted {} job {} as {}", job.job_type(), dedupe_key, id);
            return Ok(id);
        }

        let existing: i64 =
            sqlx::query_scalar("SELECT id FROM jobs WHERE job_type = $1::job_type AND dedupe_key = $2")
                .bind(job.job_type().as_str())
                .bind(&dedupe_key)
                .fetch_one(&self.pool)
                .await?;
        debug!("Not submitting {} job {}, it exists as {}", job.job_type(), dedupe_key, existing);
        Ok(existing)
    }

    async fn submit_many(&self, jobs: Vec<NewJob>) -> Result<u64, PoolError> {
        let rows = encode_rows(&jobs)?;
        let mut inserted = 0;
        for chunk in rows.chunks(INSERT_CHUNK) {
            let mut builder = QueryBuilder::<Postgres>::new(
                "INSERT INTO jobs (job_type, payload, dedupe_key, priority, timeout_seconds, max_attempts, source_machine) ",
            );
            builder.push_values(chunk, |mut row, (job, key, payload)| {
                row.push_bind(job.job_type().as_str())
                    .push_unseparated("::job_type")
                    .push_bind(payload.clone())
                    .push_bind(key.clone())
                    .push_bind(job.priority())
                    .push_bind(job.timeout_seconds)
                    .push_bind(job.max_attempts)
                    .push_bind(job.source_machine.clone());
            });
            builder.push(" ON CONFLICT (job_type, dedupe_key) DO NOTHING");
            inserted += builder.build().execute(&self.pool).await?.rows_affected();
        }
        info!(
            "Submitted {} new job(s), {} already known.",
            inserted,
            jobs.len() as u64 - inserted
        );
        Ok(inserted)
    }

    async fn claim_batch(
        &self,
        job_types: &[JobType],
        machine_id: &str,
        batch_size: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobItem>, PoolError> {
        if job_types.is_empty() || batch_size == 0 {
            return Ok(Vec::new());
        }
        let types: Vec<&str> = job_types.iter().map(JobType::as_str).collect();

        let mut items = sqlx::query_as::<_, JobItem>(
            r"
            WITH candidate AS (
                SELECT id FROM jobs
                WHERE job_type = ANY($1::text[]::job_type[])
                  AND attempts < max_attempts
                  AND ((status = 'pending' AND available_at <= $3)
                    OR (status = 'claimed' AND $3 - claimed_at > interval '1 second' * timeout_seconds))
                ORDER BY priority DESC, id
                LIMIT $4
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs
            SET status = 'claimed',
                claimed_by = $2,
                claimed_at = $3,
                attempts = jobs.attempts + 1,
                finished_at = NULL
            FROM candidate
            WHERE jobs.id = candidate.id
            RETURNING jobs.*
            ",
        )
        .bind(&types)
        .bind(machine_id)
        .bind(db_time(now))
        .bind(i64::from(batch_size))
        .fetch_all(&self.pool)
        .await?;

        // RETURNING has no defined order.
        items.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
        Ok(items)
    }

    async fn complete(&self, lease: &WorkerLease) -> Result<Completion, PoolError> {
        let result = sqlx::query(
            r"
            UPDATE jobs
            SET status = 'done', finished_at = now(), last_error = NULL
            WHERE id = $1 AND status = 'claimed' AND claimed_by = $2 AND claimed_at = $3
            ",
        )
        .bind(lease.job_id)
        .bind(&lease.machine_id)
        .bind(lease.claimed_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(Completion::Completed);
        }

        let current: Option<(JobStatus, Option<String>, Option<DateTime<Utc>>)> =
            sqlx::query_as("SELECT status, claimed_by, claimed_at FROM jobs WHERE id = $1")
                .bind(lease.job_id)
                .fetch_optional(&self.pool)
                .await?;

        match current {
            None => Err(PoolError::NotFound(lease.job_id)),
            Some((JobStatus::Done, Some(by), Some(at)))
                if by == lease.machine_id && at == lease.claimed_at =>
            {
                Ok(Completion::AlreadyDone)
            }
            Some(_) => Err(PoolError::StaleClaim {
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
        let mut tx = self.pool.begin().await?;

        let held: Option<(i32, i32)> = sqlx::query_as(
            r"
            SELECT attempts, max_attempts FROM jobs
            WHERE id = $1 AND status = 'claimed' AND claimed_by = $2 AND claimed_at = $3
            FOR UPDATE
            ",
        )
        .bind(lease.job_id)
        .bind(&lease.machine_id)
        .bind(lease.claimed_at)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((attempts, max_attempts)) = held else {
            tx.rollback().await?;
            return Err(self.stale_or_missing(lease).await);
        };

        let outcome = if permanent || attempts >= max_attempts {
            sqlx::query(
                r"
                UPDATE jobs
                SET status = 'failed', claimed_by = NULL, claimed_at = NULL, last_error = $2, finished_at = $3
                WHERE id = $1
                ",
            )
            .bind(lease.job_id)
            .bind(error)
            .bind(db_time(now))
            .execute(&mut *tx)
            .await?;
            FailOutcome::Failed
        } else {
            let available_at = db_time(now + self.retry.backoff(attempts));
            sqlx::query(
                r"
                UPDATE jobs
                SET status = 'pending', claimed_by = NULL, claimed_at = NULL, last_error = $2, available_at = $3
                WHERE id = $1
                ",
            )
            .bind(lease.job_id)
            .bind(error)
            .bind(available_at)
            .execute(&mut *tx)
            .await?;
            FailOutcome::Retrying { available_at }
        };

        tx.commit().await?;
        Ok(outcome)
    }

    async fn requeue_expired(&self, now: DateTime<Utc>) -> Result<RequeueReport, PoolError> {
        let statuses: Vec<(JobStatus,)> = sqlx::query_as(
            r"
            WITH expired AS (
                SELECT id FROM jobs
                WHERE status = 'claimed' AND $1 - claimed_at > interval '1 second' * timeout_seconds
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs
            SET status = CASE WHEN jobs.attempts >= jobs.max_attempts
                              THEN 'failed'::job_status ELSE 'pending'::job_status END,
                finished_at = CASE WHEN jobs.attempts >= jobs.max_attempts THEN $1 END,
                claimed_by = NULL,
                claimed_at = NULL,
                available_at = $1,
                last_error = 'lease expired'
            FROM expired
            WHERE jobs.id = expired.id
            RETURNING jobs.status
            ",
        )
        .bind(db_time(now))
        .fetch_all(&self.pool)
        .await?;

        let failed = statuses.iter().filter(|(s,)| *s == JobStatus::Failed).count() as u64;
        let report = RequeueReport {
            requeued: statuses.len() as u64 - failed,
            failed,
        };
        if report.failed > 0 {
            warn!("{} expired job(s) ran out of attempts and were failed.", report.failed);
        }
        Ok(report)
    }

    async fn status_counts(
        &self,
        job_type: Option<JobType>,
        now: DateTime<Utc>,
    ) -> Result<StatusCounts, PoolError> {
        let counts = sqlx::query_as::<_, StatusCounts>(
            r"
            SELECT
                count(*) FILTER (WHERE status = 'pending') AS pending,
                count(*) FILTER (WHERE status = 'claimed'
                    AND $2 - claimed_at <= interval '1 second' * timeout_seconds) AS claimed,
                count(*) FILTER (WHERE status = 'claimed'
                    AND $2 - claimed_at > interval '1 second' * timeout_seconds) AS expired,
                count(*) FILTER (WHERE status = 'done') AS done,
                count(*) FILTER (WHERE status = 'failed') AS failed
            FROM jobs
            WHERE $1::text IS NULL OR job_type = $1::job_type
            ",
        )
        .bind(job_type.map(|t| t.as_str()))
        .bind(db_time(now))
        .fetch_one(&self.pool)
        .await?;
        Ok(counts)
    }

    async fn reset_failed(&self, job_type: Option<JobType>) -> Result<u64, PoolError> {
        let result = sqlx::query(
            r"
            UPDATE jobs
            SET status = 'pending', attempts = 0, last_error = NULL, finished_at = NULL, available_at = now()
            WHERE status = 'failed' AND ($1::text IS NULL OR job_type = $1::job_type)
            ",
        )
        .bind(job_type.map(|t| t.as_str()))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn list_items(
        &self,
        job_type: JobType,
        status: JobStatus,
        after_id: i64,
        limit: u32,
    ) -> Result<Vec<JobItem>, PoolError> {
        let items = sqlx::query_as::<_, JobItem>(
            r"
            SELECT * FROM jobs
            WHERE job_type = $1::job_type AND status = $2::job_status AND id > $3
            ORDER BY id
            LIMIT $4
            ",
        )
        .bind(job_type.as_str())
        .bind(status.as_str())
        .bind(after_id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(items)
    }

    async fn revert_to_pending(&self, ids: &[i64], reason: &str) -> Result<u64, PoolError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query(
            r"
            UPDATE jobs
            SET status = 'pending', attempts = 0, claimed_by = NULL, claimed_at = NULL,
                finished_at = NULL, available_at = now(), last_error = $2
            WHERE id = ANY($1) AND status = 'done'
            ",
        )
        .bind(ids)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn backfill_done(&self, jobs: Vec<NewJob>, now: DateTime<Utc>) -> Result<u64, PoolError> {
        let rows = encode_rows(&jobs)?;
        let now = db_time(now);
        let mut affected = 0;
        for chunk in rows.chunks(INSERT_CHUNK) {
            let mut builder = QueryBuilder::<Postgres>::new(
                "INSERT INTO jobs (job_type, payload, dedupe_key, priority, timeout_seconds, max_attempts, source_machine, status, finished_at) ",
            );
            builder.push_values(chunk, |mut row, (job, key, payload)| {
                row.push_bind(job.job_type().as_str())
                    .push_unseparated("::job_type")
                    .push_bind(payload.clone())
                    .push_bind(key.clone())
                    .push_bind(job.priority())
                    .push_bind(job.timeout_seconds)
                    .push_bind(job.max_attempts)
                    .push_bind(job.source_machine.clone())
                    .push("'done'::job_status")
                    .push_bind(now);
            });
            builder.push(
                r"
                ON CONFLICT (job_type, dedupe_key) DO UPDATE
                SET status = 'done', finished_at = EXCLUDED.finished_at,
                    claimed_by = NULL, claimed_at = NULL, last_error = NULL
                WHERE jobs.status <> 'done'
                  AND (jobs.status <> 'claimed' OR ",
            );
            builder
                .push_bind(now)
                .push(" - jobs.claimed_at > interval '1 second' * jobs.timeout_seconds)");
            affected += builder.build().execute(&self.pool).await?.rows_affected();
        }
        Ok(affected)
    }
}
