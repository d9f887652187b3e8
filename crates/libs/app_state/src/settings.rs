use crate::{
    CapacitySettings, DatabaseSettings, LegacySettings, LoggingSettings, ObjectStoreBackend,
    ObjectStoreSettings, PoolSettings, RawSettings, SecretSettings, SourceKind, SourceSettings,
    WorkerSettings,
};
use color_eyre::eyre::{bail, eyre};
use color_eyre::{Report, Result};
use std::collections::HashSet;
use std::path::absolute;

#[derive(Debug, Clone)]
pub struct AppSettings {
    pub logging: LoggingSettings,
    pub secrets: SecretSettings,
    pub database: DatabaseSettings,
    pub pool: PoolSettings,
    pub worker: WorkerSettings,
    pub storage: ObjectStoreSettings,
    /// Enabled sources only, sorted by ascending priority.
    pub sources: Vec<SourceSettings>,
    pub capacity: CapacitySettings,
    pub legacy: LegacySettings,
}

impl TryFrom<RawSettings> for AppSettings {
    type Error = Report;

    fn try_from(raw: RawSettings) -> Result<Self> {
        validate_worker(&raw.worker)?;
        validate_pool(&raw.pool)?;
        validate_capacity(&raw.capacity)?;
        if raw.worker.lease_margin_seconds >= i64::from(raw.pool.default_timeout_seconds) {
            bail!(
                "worker.lease_margin_seconds ({}) must be below pool.default_timeout_seconds ({}), \
                 or every claimed job is abandoned",
                raw.worker.lease_margin_seconds,
                raw.pool.default_timeout_seconds
            );
        }
        let storage = validate_object_store("storage", raw.storage)?;

        let mut names = HashSet::new();
        let mut sources = Vec::with_capacity(raw.sources.len());
        for source in raw.sources.into_iter().filter(|s| s.enabled) {
            if !names.insert(source.name.clone()) {
                bail!("Duplicate source name '{}'", source.name);
            }
            sources.push(validate_source(source)?);
        }
        sources.sort_by_key(|s| s.priority);

        let legacy = LegacySettings {
            progress_dir: absolute(&raw.legacy.progress_dir)?,
        };

        Ok(Self {
            logging: raw.logging,
            secrets: raw.secrets,
            database: raw.database,
            pool: raw.pool,
            worker: raw.worker,
            storage,
            sources,
            capacity: raw.capacity,
            legacy,
        })
    }
}

fn validate_worker(worker: &WorkerSettings) -> Result<()> {
    if worker.batch_size == 0 {
        bail!("worker.batch_size must be at least 1");
    }
    if worker.concurrency == 0 {
        bail!("worker.concurrency must be at least 1");
    }
    if worker.lease_margin_seconds < 0 {
        bail!("worker.lease_margin_seconds can't be negative");
    }
    if worker.job_types.is_empty() {
        bail!("worker.job_types must name at least one job type");
    }
    Ok(())
}

fn validate_capacity(capacity: &CapacitySettings) -> Result<()> {
    if capacity.reserve_cores == 0 {
        bail!("capacity.reserve_cores must keep at least one core for the OS");
    }
    Ok(())
}

fn validate_pool(pool: &PoolSettings) -> Result<()> {
    if pool.default_timeout_seconds <= 0 {
        bail!("pool.default_timeout_seconds must be positive");
    }
    if pool.max_attempts <= 0 {
        bail!("pool.max_attempts must be positive");
    }
    Ok(())
}

fn validate_object_store(context: &str, mut settings: ObjectStoreSettings) -> Result<ObjectStoreSettings> {
    match settings.backend {
        ObjectStoreBackend::Local => {
            let root = settings
                .root
                .as_ref()
                .ok_or_else(|| eyre!("{context}: the local backend needs a root folder"))?;
            settings.root = Some(absolute(root)?);
        }
        ObjectStoreBackend::S3 => {
            if settings.bucket.is_none() {
                bail!("{context}: the s3 backend needs a bucket");
            }
        }
        ObjectStoreBackend::Memory => {}
    }
    settings.prefix = settings.prefix.trim_matches('/').to_owned();
    Ok(settings)
}

fn validate_source(mut source: SourceSettings) -> Result<SourceSettings> {
    match source.kind {
        SourceKind::MirrorArchive | SourceKind::DirectSite => {
            if source.url_template.is_none() {
                bail!("Source '{}' needs a url_template", source.name);
            }
        }
        SourceKind::BlobStorage => {
            let blob = source
                .blob
                .take()
                .ok_or_else(|| eyre!("Source '{}' needs a blob section", source.name))?;
            source.blob = Some(validate_object_store(&source.name, blob)?);
        }
    }
    if source.timeout_seconds == 0 {
        bail!("Source '{}' needs a positive timeout_seconds", source.name);
    }
    Ok(source)
}
