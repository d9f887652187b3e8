use crate::context::{WorkerContext, WorkerOptions};
use crate::handlers::{HandlerError, JobResult};
use app_state::AppSettings;
use chrono::Utc;
use color_eyre::Result;
use color_eyre::eyre::bail;
use common_services::alert;
use common_services::database::get_db_pool;
use common_services::job_pool::{Completion, FailOutcome, PoolError};
use common_types::{JobItem, JobPayload, WorkerLease};
use futures_util::{StreamExt, stream};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const MAX_POOL_BACKOFF: Duration = Duration::from_secs(60);

/// What happened to one claimed item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    Completed,
    Retrying,
    Failed,
    /// Someone else owns the row now; our result was dropped.
    Stale,
    /// The lease was about to run out, so nothing was reported.
    Abandoned,
    /// The pool rejected the report for another reason. The lease will lapse.
    ReportFailed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub batches: u64,
    pub completed: u64,
    pub retrying: u64,
    pub failed: u64,
    pub stale: u64,
    pub abandoned: u64,
    pub report_failures: u64,
}

impl WorkerStats {
    fn record(&mut self, outcome: ItemOutcome) {
        match outcome {
            ItemOutcome::Completed => self.completed += 1,
            ItemOutcome::Retrying => self.retrying += 1,
            ItemOutcome::Failed => self.failed += 1,
            ItemOutcome::Stale => self.stale += 1,
            ItemOutcome::Abandoned => self.abandoned += 1,
            ItemOutcome::ReportFailed => self.report_failures += 1,
        }
    }
}

/// Connects to the database, builds the context and runs until `shutdown` fires
/// (or, with `stop_on_idle`, until the pool has nothing left for us).
pub async fn create_worker(
    settings: &AppSettings,
    options: WorkerOptions,
    shutdown: CancellationToken,
) -> Result<WorkerStats> {
    let db = get_db_pool(settings, true).await?;
    let context = WorkerContext::from_settings(settings, db, options)?;
    info!(
        "🛠️ [Worker {}] Starting: job types {:?}, batch size {}, concurrency {}",
        context.machine_id,
        context.options.job_types,
        context.options.batch_size,
        context.options.concurrency
    );
    run_worker_loop(&context, &shutdown).await
}

/// Sleeps for `duration` unless shutdown is requested first. Returns false on shutdown.
async fn sleep_or_shutdown(duration: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        () = tokio::time::sleep(duration) => true,
        () = shutdown.cancelled() => false,
    }
}

fn pool_backoff(base: Duration, failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(16);
    base.max(Duration::from_millis(100))
        .saturating_mul(2_u32.pow(exponent))
        .min(MAX_POOL_BACKOFF)
}

/// The claim loop: claim a batch, process it with bounded concurrency, report every item, repeat.
///
/// Shutdown is checked between batches only, so a batch that has started always finishes.
///
/// # Errors
///
/// Returns an error when the pool stays unreachable for `max_pool_failures` consecutive claims,
/// or when a claim fails for a reason other than the pool being unreachable.
pub async fn run_worker_loop(context: &WorkerContext, shutdown: &CancellationToken) -> Result<WorkerStats> {
    let options = &context.options;
    let mut stats = WorkerStats::default();
    let mut pool_failures = 0;
    let mut idle_cycles: u32 = 0;
    let mut sleeping = false;

    while !shutdown.is_cancelled() {
        let claimed = context
            .pool
            .claim_batch(
                &options.job_types,
                &context.machine_id,
                options.batch_size,
                Utc::now(),
            )
            .await;
        let batch = match claimed {
            Ok(batch) => {
                pool_failures = 0;
                batch
            }
            Err(err) if err.is_unavailable() => {
                pool_failures += 1;
                if pool_failures >= options.max_pool_failures {
                    alert!("Job pool unreachable for {pool_failures} consecutive claims, stopping");
                    bail!("Job pool unavailable: {err}");
                }
                let delay = pool_backoff(options.idle_sleep, pool_failures);
                warn!("Claim failed ({err}), retrying in {delay:?}");
                if !sleep_or_shutdown(delay, shutdown).await {
                    break;
                }
                continue;
            }
            Err(err) => return Err(err.into()),
        };

        if batch.is_empty() {
            idle_cycles = idle_cycles.wrapping_add(1);
            if options.requeue_every_idle > 0 && idle_cycles % options.requeue_every_idle == 0 {
                requeue_expired(context).await;
            }
            if !sleeping {
                sleeping = true;
                info!("💤 No jobs, going to sleep...");
            }
            if options.stop_on_idle || !sleep_or_shutdown(options.idle_sleep, shutdown).await {
                break;
            }
            continue;
        }

        sleeping = false;
        idle_cycles = 0;
        stats.batches += 1;
        info!("🐜 Claimed {} jobs", batch.len());

        let outcomes: Vec<ItemOutcome> = stream::iter(batch)
            .map(|item| process_item(context, item))
            .buffer_unordered(options.concurrency.max(1))
            .collect()
            .await;
        for outcome in outcomes {
            stats.record(outcome);
        }
    }

    info!(
        "Worker {} stopped: {} completed, {} retrying, {} failed, {} stale, {} abandoned",
        context.machine_id, stats.completed, stats.retrying, stats.failed, stats.stale, stats.abandoned
    );
    Ok(stats)
}

async fn requeue_expired(context: &WorkerContext) {
    match context.pool.requeue_expired(Utc::now()).await {
        Ok(report) if report.requeued + report.failed > 0 => info!(
            "Requeued {} expired claims, {} of them out of attempts",
            report.requeued + report.failed,
            report.failed
        ),
        Ok(_) => debug!("No expired claims"),
        Err(err) => warn!("Requeueing expired claims failed: {err}"),
    }
}

/// Decodes the payload and runs its handler. Malformed payloads are permanent failures.
pub async fn run_handler(context: &WorkerContext, item: &JobItem) -> Result<JobResult, HandlerError> {
    let payload = JobPayload::decode(item.job_type, &item.payload)
        .map_err(|e| HandlerError::Permanent(format!("Malformed {} payload: {e}", item.job_type)))?;
    context.handlers.handle(&payload).await
}

async fn process_item(context: &WorkerContext, item: JobItem) -> ItemOutcome {
    let Some(lease) = WorkerLease::from_item(&item) else {
        error!("Job {} came back from a claim without a lease", item.id);
        return ItemOutcome::ReportFailed;
    };
    // Items queued behind `buffer_unordered` may start late.
    if lease.is_nearly_expired(Utc::now(), context.options.lease_margin) {
        warn!(
            "Lease on job {} ends at {}, not starting it",
            item.id, lease.expires_at
        );
        return ItemOutcome::Abandoned;
    }
    debug!("Processing {} job {} ({})", item.job_type, item.id, item.dedupe_key);

    let result = run_handler(context, &item).await;

    let now = Utc::now();
    if lease.is_nearly_expired(now, context.options.lease_margin) {
        warn!(
            "Lease on job {} ends at {}, abandoning it rather than racing a reclaim",
            item.id, lease.expires_at
        );
        return ItemOutcome::Abandoned;
    }

    match result {
        Ok(job_result) => match context.pool.complete(&lease).await {
            Ok(Completion::Completed | Completion::AlreadyDone) => {
                debug!("Job {} done ({job_result:?})", item.id);
                ItemOutcome::Completed
            }
            Err(err) => report_error(item.id, &err),
        },
        Err(handler_err) => {
            let permanent = handler_err.is_permanent();
            let message = handler_err.to_string();
            match context.pool.fail(&lease, permanent, &message, now).await {
                Ok(FailOutcome::Retrying { available_at }) => {
                    warn!(
                        "Job {} attempt {}/{} failed, retrying from {available_at}: {message}",
                        item.id, item.attempts, item.max_attempts
                    );
                    ItemOutcome::Retrying
                }
                Ok(FailOutcome::Failed) => {
                    error!("Job {} failed permanently: {message}", item.id);
                    ItemOutcome::Failed
                }
                Err(err) => report_error(item.id, &err),
            }
        }
    }
}

fn report_error(job_id: i64, err: &PoolError) -> ItemOutcome {
    if err.is_stale_claim() {
        warn!("Dropping result of job {job_id}: {err}");
        ItemOutcome::Stale
    } else {
        error!("Could not report job {job_id}: {err}");
        ItemOutcome::ReportFailed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::{HandlerRegistry, JobHandler};
    use async_trait::async_trait;
    use chrono::DateTime;
    use common_services::job_pool::{
        JobDefaults, JobPool, MemoryJobPool, NewJob, RequeueReport, RetryPolicy,
    };
    use common_types::{FetchPayload, JobStatus, JobType, StatusCounts};
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedHandler {
        fail_with: Option<fn(String) -> HandlerError>,
        calls: AtomicUsize,
    }

    impl ScriptedHandler {
        fn ok() -> Arc<Self> {
            Arc::new(Self {
                fail_with: None,
                calls: AtomicUsize::new(0),
            })
        }

        fn failing(kind: fn(String) -> HandlerError) -> Arc<Self> {
            Arc::new(Self {
                fail_with: Some(kind),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl JobHandler for ScriptedHandler {
        fn job_type(&self) -> JobType {
            JobType::Fetch
        }

        async fn handle(&self, _payload: &JobPayload) -> Result<JobResult, HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.fail_with {
                Some(kind) => Err(kind("all sources exhausted".to_owned())),
                None => Ok(JobResult::Done),
            }
        }
    }

    fn options() -> WorkerOptions {
        WorkerOptions {
            job_types: vec![JobType::Fetch],
            batch_size: 4,
            concurrency: 2,
            idle_sleep: Duration::from_millis(1),
            max_pool_failures: 3,
            requeue_every_idle: 1,
            lease_margin: chrono::Duration::seconds(5),
            skip_existing: true,
            stop_on_idle: true,
        }
    }

    fn context(pool: Arc<dyn JobPool>, handler: Arc<ScriptedHandler>, options: WorkerOptions) -> Result<WorkerContext> {
        WorkerContext::new(
            "test-box".to_owned(),
            pool,
            HandlerRegistry::default().with(handler),
            options,
        )
    }

    async fn seeded_pool(count: u64, max_attempts: i32) -> Result<Arc<MemoryJobPool>> {
        let pool = Arc::new(MemoryJobPool::new(RetryPolicy::immediate()));
        let defaults = JobDefaults {
            source_machine: "submitter".to_owned(),
            timeout_seconds: 60,
            max_attempts,
        };
        let jobs = (1..=count)
            .map(|n| defaults.job(FetchPayload::new("DataSet 1", n)))
            .collect();
        pool.submit_many(jobs).await?;
        Ok(pool)
    }

    #[tokio::test]
    async fn drains_the_pool_and_stops_when_idle() -> Result<()> {
        let pool = seeded_pool(10, 5).await?;
        let handler = ScriptedHandler::ok();
        let context = context(pool.clone(), handler.clone(), options())?;

        let stats = run_worker_loop(&context, &CancellationToken::new()).await?;

        assert_eq!(stats.completed, 10);
        assert_eq!(stats.batches, 3);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 10);
        let counts = pool.status_counts(None, Utc::now()).await?;
        assert_eq!(counts.done, 10);
        Ok(())
    }

    #[tokio::test]
    async fn retryable_failures_stop_at_the_ceiling() -> Result<()> {
        let pool = seeded_pool(1, 3).await?;
        let handler = ScriptedHandler::failing(HandlerError::Retryable);
        let context = context(pool.clone(), handler.clone(), options())?;

        let stats = run_worker_loop(&context, &CancellationToken::new()).await?;

        assert_eq!((stats.retrying, stats.failed), (2, 1));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        let row = pool.get(1)?.expect("row exists");
        assert_eq!(row.status, JobStatus::Failed);
        assert_eq!(row.last_error.as_deref(), Some("all sources exhausted"));
        Ok(())
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() -> Result<()> {
        let pool = seeded_pool(1, 5).await?;
        let handler = ScriptedHandler::failing(HandlerError::Permanent);
        let context = context(pool.clone(), handler.clone(), options())?;

        let stats = run_worker_loop(&context, &CancellationToken::new()).await?;

        assert_eq!(stats.failed, 1);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    async fn nearly_expired_lease_is_abandoned() -> Result<()> {
        let pool = seeded_pool(1, 5).await?;
        let mut options = options();
        options.lease_margin = chrono::Duration::seconds(120);
        let handler = ScriptedHandler::ok();
        let context = context(pool.clone(), handler.clone(), options)?;

        let stats = run_worker_loop(&context, &CancellationToken::new()).await?;

        assert_eq!(stats.abandoned, 1);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0, "no download on a lapsing lease");
        assert_eq!(pool.get(1)?.map(|j| j.status), Some(JobStatus::Claimed));
        Ok(())
    }

    #[tokio::test]
    async fn malformed_payload_is_permanent() -> Result<()> {
        let pool = seeded_pool(1, 5).await?;
        let context = context(pool.clone(), ScriptedHandler::ok(), options())?;
        let mut item = pool.get(1)?.expect("row exists");
        item.payload = json!({"dataset": "DataSet 1"});

        let err = run_handler(&context, &item).await.expect_err("missing efta_number");
        assert!(err.is_permanent());
        Ok(())
    }

    #[tokio::test]
    async fn cancelled_worker_claims_nothing() -> Result<()> {
        let pool = seeded_pool(3, 5).await?;
        let mut options = options();
        options.stop_on_idle = false;
        let context = context(pool.clone(), ScriptedHandler::ok(), options)?;
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let stats = run_worker_loop(&context, &shutdown).await?;

        assert_eq!(stats, WorkerStats::default());
        assert_eq!(pool.status_counts(None, Utc::now()).await?.pending, 3);
        Ok(())
    }

    #[test]
    fn unhandled_job_types_are_dropped() -> Result<()> {
        let pool: Arc<dyn JobPool> = Arc::new(MemoryJobPool::default());
        let mut options = options();
        options.job_types = vec![JobType::Ocr, JobType::Fetch, JobType::Fetch];
        let context = context(pool.clone(), ScriptedHandler::ok(), options.clone())?;
        assert_eq!(context.options.job_types, [JobType::Fetch]);

        options.job_types = vec![JobType::Ocr];
        assert!(WorkerContext::new(
            "test-box".to_owned(),
            pool,
            HandlerRegistry::default().with(ScriptedHandler::ok()),
            options
        )
        .is_err());
        Ok(())
    }

    /// A pool whose backing store is down.
    struct DownPool;

    fn down<T>() -> Result<T, PoolError> {
        Err(PoolError::Unavailable("connection refused".to_owned()))
    }

    #[async_trait]
    impl JobPool for DownPool {
        async fn submit(&self, _job: NewJob) -> Result<i64, PoolError> {
            down()
        }
        async fn submit_many(&self, _jobs: Vec<NewJob>) -> Result<u64, PoolError> {
            down()
        }
        async fn claim_batch(
            &self,
            _job_types: &[JobType],
            _machine_id: &str,
            _batch_size: u32,
            _now: DateTime<Utc>,
        ) -> Result<Vec<JobItem>, PoolError> {
            down()
        }
        async fn complete(&self, _lease: &WorkerLease) -> Result<Completion, PoolError> {
            down()
        }
        async fn fail(
            &self,
            _lease: &WorkerLease,
            _permanent: bool,
            _error: &str,
            _now: DateTime<Utc>,
        ) -> Result<FailOutcome, PoolError> {
            down()
        }
        async fn requeue_expired(&self, _now: DateTime<Utc>) -> Result<RequeueReport, PoolError> {
            down()
        }
        async fn status_counts(
            &self,
            _job_type: Option<JobType>,
            _now: DateTime<Utc>,
        ) -> Result<StatusCounts, PoolError> {
            down()
        }
        async fn reset_failed(&self, _job_type: Option<JobType>) -> Result<u64, PoolError> {
            down()
        }
        async fn list_items(
            &self,
            _job_type: JobType,
            _status: JobStatus,
            _after_id: i64,
            _limit: u32,
        ) -> Result<Vec<JobItem>, PoolError> {
            down()
        }
        async fn revert_to_pending(&self, _ids: &[i64], _reason: &str) -> Result<u64, PoolError> {
            down()
        }
        async fn backfill_done(&self, _jobs: Vec<NewJob>, _now: DateTime<Utc>) -> Result<u64, PoolError> {
            down()
        }
    }

    #[tokio::test]
    async fn unreachable_pool_is_fatal_after_max_failures() -> Result<()> {
        let context = context(Arc::new(DownPool), ScriptedHandler::ok(), options())?;

        let result = run_worker_loop(&context, &CancellationToken::new()).await;

        assert!(result.is_err_and(|e| e.to_string().contains("unavailable")));
        Ok(())
    }

    #[test]
    fn pool_backoff_grows_and_caps() {
        let base = Duration::from_secs(1);
        assert_eq!(pool_backoff(base, 1), Duration::from_secs(1));
        assert_eq!(pool_backoff(base, 3), Duration::from_secs(4));
        assert_eq!(pool_backoff(base, 30), MAX_POOL_BACKOFF);
    }
}
