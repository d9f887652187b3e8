use crate::handlers::HandlerRegistry;
use crate::handlers::fetch::FetchHandler;
use app_state::{AppSettings, WorkerSettings};
use color_eyre::Result;
use color_eyre::eyre::bail;
use common_services::job_pool::{JobPool, PgJobPool, RetryPolicy};
use common_services::sources::SourceRegistry;
use common_services::storage::ArtifactStore;
use common_services::utils::machine_id;
use common_types::JobType;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Tunables of the claim loop.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub job_types: Vec<JobType>,
    pub batch_size: u32,
    /// Items of one batch processed at the same time.
    pub concurrency: usize,
    pub idle_sleep: Duration,
    /// Consecutive failed claims (pool unreachable) before the worker gives up.
    pub max_pool_failures: u32,
    /// Run `requeue_expired` every this many idle cycles; 0 disables it.
    pub requeue_every_idle: u32,
    /// Leases with less than this left are abandoned instead of reported.
    pub lease_margin: chrono::Duration,
    pub skip_existing: bool,
    /// Exit as soon as a claim comes back empty.
    pub stop_on_idle: bool,
}

impl WorkerOptions {
    #[must_use]
    pub fn from_settings(settings: &WorkerSettings) -> Self {
        Self {
            job_types: settings.job_types.clone(),
            batch_size: settings.batch_size,
            concurrency: settings.concurrency,
            idle_sleep: Duration::from_millis(settings.idle_sleep_ms),
            max_pool_failures: settings.max_pool_failures,
            requeue_every_idle: settings.requeue_every_idle,
            lease_margin: chrono::Duration::seconds(settings.lease_margin_seconds),
            skip_existing: settings.skip_existing,
            stop_on_idle: false,
        }
    }
}

pub struct WorkerContext {
    pub machine_id: String,
    pub pool: Arc<dyn JobPool>,
    pub handlers: HandlerRegistry,
    pub options: WorkerOptions,
}

impl WorkerContext {
    /// Keeps only the configured job types that have a handler.
    ///
    /// # Errors
    ///
    /// Fails when none of the configured job types can be handled by this binary.
    pub fn new(
        machine_id: String,
        pool: Arc<dyn JobPool>,
        handlers: HandlerRegistry,
        mut options: WorkerOptions,
    ) -> Result<Self> {
        let available = handlers.job_types();
        for job_type in options.job_types.iter().filter(|t| !available.contains(t)) {
            warn!("No handler for {job_type} jobs, not claiming them");
        }
        options.job_types.retain(|t| available.contains(t));
        options.job_types.sort();
        options.job_types.dedup();
        if options.job_types.is_empty() {
            bail!("None of the configured job types has a handler");
        }
        Ok(Self {
            machine_id,
            pool,
            handlers,
            options,
        })
    }

    /// Wires the PostgreSQL pool, the configured sources and the artifact store into a context.
    pub fn from_settings(settings: &AppSettings, db: PgPool, options: WorkerOptions) -> Result<Self> {
        let pool = PgJobPool::new(db, RetryPolicy::from_settings(&settings.pool));
        let sources = SourceRegistry::from_settings(&settings.sources)?;
        if sources.is_empty() {
            warn!("No sources are enabled, every fetch job will fail");
        }
        let store = ArtifactStore::from_settings(&settings.storage)?;
        let handlers = HandlerRegistry::default().with(Arc::new(FetchHandler::new(
            sources,
            store,
            options.skip_existing,
        )));

        Self::new(machine_id(&settings.worker), Arc::new(pool), handlers, options)
    }
}
