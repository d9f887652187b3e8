//! Runs the job pool against a real PostgreSQL database.
//!
//! `DATABASE_URL=postgres://... cargo test -p common_services -- --ignored`
//! The `jobs` table of that database is truncated.

use chrono::{Duration, Utc};
use color_eyre::Result;
use color_eyre::eyre::eyre;
use common_services::job_pool::{
    Completion, FailOutcome, JobDefaults, JobPool, NewJob, PgJobPool, RetryPolicy,
};
use common_types::{FetchPayload, JobStatus, JobType, WorkerLease};
use sqlx::postgres::PgPoolOptions;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};

/// The tests share one table, so they take turns.
static DB_LOCK: Mutex<()> = Mutex::const_new(());

async fn fresh_pool() -> Result<(MutexGuard<'static, ()>, PgJobPool)> {
    let guard = DB_LOCK.lock().await;
    let pool = connect().await?;
    Ok((guard, pool))
}

async fn connect() -> Result<PgJobPool> {
    let url = std::env::var("DATABASE_URL").map_err(|_| eyre!("DATABASE_URL is not set"))?;
    let db = PgPoolOptions::new().max_connections(16).connect(&url).await?;
    sqlx::migrate!("./migrations").run(&db).await?;
    sqlx::query("TRUNCATE jobs RESTART IDENTITY").execute(&db).await?;
    Ok(PgJobPool::new(db, RetryPolicy::immediate()))
}

fn job(number: u64, priority: i32, max_attempts: i32) -> NewJob {
    let defaults = JobDefaults {
        source_machine: "it".to_owned(),
        timeout_seconds: 60,
        max_attempts,
    };
    let mut job = defaults.job(FetchPayload::new("DataSet IT", number));
    job.priority = Some(priority);
    job
}

fn lease(items: &[common_types::JobItem]) -> Result<WorkerLease> {
    items
        .first()
        .and_then(WorkerLease::from_item)
        .ok_or_else(|| eyre!("nothing claimed"))
}

#[tokio::test]
#[ignore = "needs DATABASE_URL"]
async fn pool_semantics_on_postgres() -> Result<()> {
    let (_guard, pool) = fresh_pool().await?;
    let fetch = [JobType::Fetch];

    // Priority first, then submission order.
    for (number, priority) in [(1, 5), (2, 1), (3, 5)] {
        pool.submit(job(number, priority, 3)).await?;
    }
    assert_eq!(pool.submit(job(1, 5, 3)).await?, 1, "resubmission returns the existing id");
    let now = Utc::now();
    let batch = pool.claim_batch(&fetch, "box-a", 2, now).await?;
    assert_eq!(batch.iter().map(|j| j.id).collect::<Vec<_>>(), [1, 3]);

    // Completion is idempotent for the same lease.
    let first = WorkerLease::from_item(&batch[0]).ok_or_else(|| eyre!("no lease"))?;
    assert_eq!(pool.complete(&first).await?, Completion::Completed);
    assert_eq!(pool.complete(&first).await?, Completion::AlreadyDone);

    // Job 3 is orphaned; it comes back only after its timeout.
    let orphan = WorkerLease::from_item(&batch[1]).ok_or_else(|| eyre!("no lease"))?;
    let early = pool.claim_batch(&fetch, "box-b", 10, now + Duration::seconds(30)).await?;
    assert_eq!(early.iter().map(|j| j.id).collect::<Vec<_>>(), [2]);
    let rescued = pool.claim_batch(&fetch, "box-b", 10, now + Duration::seconds(61)).await?;
    assert_eq!(rescued.iter().map(|j| j.id).collect::<Vec<_>>(), [3]);
    assert!(pool.complete(&orphan).await.is_err_and(|e| e.is_stale_claim()));

    // Retryable failures run into the ceiling.
    let later = now + Duration::seconds(61);
    let mut current = lease(&rescued)?;
    assert!(matches!(
        pool.fail(&current, false, "timeout", later).await?,
        FailOutcome::Retrying { .. }
    ));
    current = lease(&pool.claim_batch(&fetch, "box-b", 1, later).await?)?;
    assert_eq!(pool.fail(&current, false, "timeout", later).await?, FailOutcome::Failed);
    assert_eq!(pool.reset_failed(Some(JobType::Fetch)).await?, 1);

    let counts = pool.status_counts(None, later).await?;
    // Job 2 has been held by box-b since now + 30s, so its lease is still live.
    assert_eq!(
        (counts.pending, counts.claimed, counts.expired, counts.done),
        (1, 1, 0, 1)
    );
    Ok(())
}

#[tokio::test]
#[ignore = "needs DATABASE_URL"]
async fn concurrent_claims_never_overlap_on_postgres() -> Result<()> {
    let (_guard, pool) = fresh_pool().await?;
    let pool = Arc::new(pool);
    let total = 500;
    pool.submit_many((1..=total).map(|n| job(n, (n % 5) as i32, 5)).collect())
        .await?;

    let now = Utc::now();
    let mut handles = Vec::new();
    for claimer in 0..12 {
        let pool = Arc::clone(&pool);
        handles.push(tokio::spawn(async move {
            let mut ids = Vec::new();
            loop {
                let batch = pool
                    .claim_batch(&[JobType::Fetch], &format!("box-{claimer}"), 9, now)
                    .await?;
                if batch.is_empty() {
                    return Ok::<_, common_services::job_pool::PoolError>(ids);
                }
                ids.extend(batch.into_iter().map(|j| j.id));
            }
        }));
    }

    let mut seen = HashSet::new();
    for handle in handles {
        for id in handle.await?? {
            assert!(seen.insert(id), "job {id} claimed twice");
        }
    }
    assert_eq!(seen.len(), total as usize);

    let claimed = pool.list_items(JobType::Fetch, JobStatus::Claimed, 0, 1000).await?;
    assert_eq!(claimed.len(), total as usize);
    Ok(())
}

#[tokio::test]
#[ignore = "needs DATABASE_URL"]
async fn backfill_and_revert_on_postgres() -> Result<()> {
    let (_guard, pool) = fresh_pool().await?;
    pool.submit(job(1, 0, 5)).await?;
    let now = Utc::now();

    let affected = pool
        .backfill_done(vec![job(1, 0, 5), job(2, 0, 5), job(2, 0, 5)], now)
        .await?;
    assert_eq!(affected, 2);

    let done = pool.list_items(JobType::Fetch, JobStatus::Done, 0, 10).await?;
    assert_eq!(done.len(), 2);
    assert_eq!(pool.revert_to_pending(&[done[0].id], "artifact missing").await?, 1);

    let expired = pool.requeue_expired(now).await?;
    assert_eq!(expired.requeued + expired.failed, 0);
    Ok(())
}
