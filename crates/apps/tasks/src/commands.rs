use app_state::AppSettings;
use chrono::Utc;
use clap::Subcommand;
use color_eyre::Result;
use color_eyre::eyre::{Context, bail};
use common_services::capacity::{self, CapacityPlan, CapacityPolicy, LaunchSpec};
use common_services::database::get_db_pool;
use common_services::job_pool::{JobDefaults, JobPool, NewJob, PgJobPool, RetryPolicy};
use common_services::reconcile::ProgressReconciler;
use common_services::storage::ArtifactStore;
use common_services::utils::machine_id;
use common_types::{FetchPayload, JobPayload, JobType, StatusCounts};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

const SUBMIT_CHUNK: usize = 5000;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Show job counts per status.
    Status {
        #[arg(long)]
        job_type: Option<JobType>,
    },
    /// Queue fetch jobs for a range of EFTA numbers of one dataset.
    Submit {
        #[arg(long)]
        dataset: String,
        #[arg(long)]
        from: u64,
        /// Inclusive.
        #[arg(long)]
        to: u64,
        #[arg(long)]
        priority: Option<i32>,
    },
    /// Queue jobs from a JSON-lines file, one payload per line.
    SubmitFile {
        path: PathBuf,
        #[arg(long, default_value = "fetch")]
        job_type: JobType,
        #[arg(long)]
        priority: Option<i32>,
    },
    /// Give permanently failed jobs a fresh attempt budget.
    ResetFailed {
        #[arg(long)]
        job_type: Option<JobType>,
    },
    /// Return expired claims to pending right away.
    RequeueExpired,
    /// Reconcile done fetch jobs with the artifact store.
    Sync,
    /// Import progress files written before the shared pool existed.
    MigrateLegacy {
        /// Defaults to `legacy.progress_dir` from the settings.
        #[arg(long)]
        dir: Option<PathBuf>,
    },
    /// Print how many workers this machine should run.
    Plan,
    /// Start the planned number of worker processes and exit.
    Launch,
}

/// Fetch jobs for `from..=to` of `dataset`.
pub fn range_jobs(defaults: &JobDefaults, dataset: &str, from: u64, to: u64, priority: Option<i32>) -> Result<Vec<NewJob>> {
    if from > to {
        bail!("Empty range: --from {from} is past --to {to}");
    }
    Ok((from..=to)
        .map(|number| {
            let mut job = defaults.job(FetchPayload::new(dataset, number));
            job.priority = priority;
            job
        })
        .collect())
}

/// Parses a JSON-lines file of payloads for `job_type`. Blank lines are skipped.
pub fn read_jobs_file(path: &Path, job_type: JobType, defaults: &JobDefaults, priority: Option<i32>) -> Result<Vec<NewJob>> {
    let text = std::fs::read_to_string(path).wrap_err_with(|| format!("Can't read {}", path.display()))?;
    let mut jobs = Vec::new();
    for (index, line) in text.lines().enumerate().filter(|(_, l)| !l.trim().is_empty()) {
        let value: serde_json::Value =
            serde_json::from_str(line).wrap_err_with(|| format!("{}:{}: invalid JSON", path.display(), index + 1))?;
        let payload = JobPayload::decode(job_type, &value)
            .wrap_err_with(|| format!("{}:{}: not a {job_type} payload", path.display(), index + 1))?;
        let mut job = defaults.job(payload);
        job.priority = priority;
        jobs.push(job);
    }
    Ok(jobs)
}

pub async fn submit_all(pool: &dyn JobPool, jobs: Vec<NewJob>) -> Result<u64> {
    let total = jobs.len();
    let mut inserted = 0;
    for chunk in jobs.chunks(SUBMIT_CHUNK) {
        inserted += pool.submit_many(chunk.to_vec()).await?;
    }
    info!("Submitted {total} jobs, {inserted} new, {} already known", total as u64 - inserted);
    Ok(inserted)
}

#[must_use]
pub fn format_counts(job_type: JobType, counts: &StatusCounts) -> String {
    format!(
        "{:<12} pending {:>8}  claimed {:>6}  expired {:>6}  done {:>8}  failed {:>6}  total {:>8}",
        job_type.as_str(),
        counts.pending,
        counts.claimed,
        counts.expired,
        counts.done,
        counts.failed,
        counts.total()
    )
}

#[must_use]
pub fn format_plan(plan: &CapacityPlan) -> String {
    format!(
        "{} worker instance(s) x concurrency {} = {} concurrent jobs",
        plan.instance_count,
        plan.concurrency_per_instance,
        plan.total_concurrency()
    )
}

fn plan_for_this_machine(settings: &AppSettings) -> CapacityPlan {
    let resources = capacity::detect_resources();
    info!(
        "Detected {} cores, {} MB available memory",
        resources.cpu_cores, resources.available_memory_mb
    );
    capacity::plan(
        resources.input(&settings.capacity),
        CapacityPolicy::from_settings(&settings.capacity),
    )
}

pub async fn run_command(command: Command, settings: &AppSettings) -> Result<()> {
    // These two never touch the database.
    match command {
        Command::Plan => {
            println!("{}", format_plan(&plan_for_this_machine(settings)));
            return Ok(());
        }
        Command::Launch => {
            let plan = plan_for_this_machine(settings);
            println!("{}", format_plan(&plan));
            let pids = capacity::launch(plan, &LaunchSpec::from_settings(&settings.capacity))?;
            println!("Started worker pids: {pids:?}");
            return Ok(());
        }
        _ => {}
    }

    let db = get_db_pool(settings, true).await?;
    let pool: Arc<dyn JobPool> = Arc::new(PgJobPool::new(db, RetryPolicy::from_settings(&settings.pool)));
    let defaults = JobDefaults::new(&settings.pool, machine_id(&settings.worker));

    match command {
        Command::Status { job_type } => {
            let now = Utc::now();
            let types = job_type.map_or_else(|| JobType::ALL.to_vec(), |t| vec![t]);
            for job_type in types {
                let counts = pool.status_counts(Some(job_type), now).await?;
                println!("{}", format_counts(job_type, &counts));
            }
        }
        Command::Submit {
            dataset,
            from,
            to,
            priority,
        } => {
            let jobs = range_jobs(&defaults, &dataset, from, to, priority)?;
            submit_all(pool.as_ref(), jobs).await?;
        }
        Command::SubmitFile {
            path,
            job_type,
            priority,
        } => {
            let jobs = read_jobs_file(&path, job_type, &defaults, priority)?;
            submit_all(pool.as_ref(), jobs).await?;
        }
        Command::ResetFailed { job_type } => {
            let reset = pool.reset_failed(job_type).await?;
            println!("Reset {reset} failed jobs");
        }
        Command::RequeueExpired => {
            let report = pool.requeue_expired(Utc::now()).await?;
            println!(
                "Requeued {} expired claims, failed {} that were out of attempts",
                report.requeued, report.failed
            );
        }
        Command::Sync => {
            let store = ArtifactStore::from_settings(&settings.storage)?;
            let report = ProgressReconciler::new(pool, store, defaults).sync(Utc::now()).await?;
            println!(
                "{} artifacts, {} done items: reverted {}, backfilled {}",
                report.artifacts, report.done_items, report.reverted, report.backfilled
            );
        }
        Command::MigrateLegacy { dir } => {
            let dir = dir.unwrap_or_else(|| settings.legacy.progress_dir.clone());
            let store = ArtifactStore::from_settings(&settings.storage)?;
            let report = ProgressReconciler::new(pool, store, defaults)
                .migrate_legacy(&dir, Utc::now())
                .await?;
            println!(
                "{} progress files: {} done, {} queued ({} claimed done without an artifact)",
                report.files, report.backfilled, report.submitted, report.missing_artifacts
            );
        }
        Command::Plan | Command::Launch => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use common_services::job_pool::MemoryJobPool;
    use common_types::JobStatus;

    fn defaults() -> JobDefaults {
        JobDefaults {
            source_machine: "operator".to_owned(),
            timeout_seconds: 900,
            max_attempts: 5,
        }
    }

    #[tokio::test]
    async fn resubmitting_a_range_adds_only_new_items() -> Result<()> {
        let pool = MemoryJobPool::new(RetryPolicy::default());
        let first = range_jobs(&defaults(), "DataSet 9", 1, 10, None)?;
        assert_eq!(submit_all(&pool, first).await?, 10);

        let overlapping = range_jobs(&defaults(), "DataSet 9", 5, 15, Some(99))?;
        assert_eq!(submit_all(&pool, overlapping).await?, 5);

        let pending = pool.list_items(JobType::Fetch, JobStatus::Pending, 0, 100).await?;
        assert_eq!(pending.len(), 15);
        assert_eq!(pending[0].priority, JobType::Fetch.default_priority());
        assert_eq!(pending[14].priority, 99);
        Ok(())
    }

    #[test]
    fn inverted_range_is_rejected() {
        assert!(range_jobs(&defaults(), "DataSet 9", 10, 1, None).is_err());
    }

    #[test]
    fn jobs_file_is_decoded_per_job_type() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("docs.jsonl");
        std::fs::write(&path, "{\"document_id\": \"doc-1\"}\n\n{\"document_id\": \"doc-2\"}\n")?;

        let jobs = read_jobs_file(&path, JobType::Ocr, &defaults(), None)?;
        let keys: Vec<_> = jobs.iter().map(NewJob::dedupe_key).collect();
        assert_eq!(keys, ["doc-1", "doc-2"]);
        assert!(jobs.iter().all(|j| j.job_type() == JobType::Ocr));

        let err = read_jobs_file(&path, JobType::Fetch, &defaults(), None).expect_err("not fetch payloads");
        assert!(err.to_string().contains("docs.jsonl:1"));
        Ok(())
    }

    #[test]
    fn counts_line_includes_total() {
        let counts = StatusCounts {
            pending: 3,
            claimed: 1,
            expired: 1,
            done: 10,
            failed: 2,
        };
        let line = format_counts(JobType::Fetch, &counts);
        assert!(line.starts_with("fetch"));
        assert!(line.ends_with("total       17"));
    }
}
