use common_types::JobType;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Settings as they appear in `config/settings.yaml` (plus `APP__*` overrides).
#[derive(Debug, Deserialize, Clone)]
pub struct RawSettings {
    pub logging: LoggingSettings,
    pub secrets: SecretSettings,
    pub database: DatabaseSettings,
    pub pool: PoolSettings,
    pub worker: WorkerSettings,
    /// Where fetched artifacts are persisted.
    pub storage: ObjectStoreSettings,
    /// Origins for fetch jobs, tried in ascending `priority`.
    #[serde(default)]
    pub sources: Vec<SourceSettings>,
    pub capacity: CapacitySettings,
    pub legacy: LegacySettings,
}

/// Logging configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingSettings {
    pub level: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SecretSettings {
    pub database_url: String,
}

/// Database connection pool configuration. Durations are in seconds.
#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseSettings {
    pub max_connections: u32,
    pub min_connections: u32,
    pub max_lifetime: u64,
    pub idle_timeout: u64,
    pub acquire_timeout: u64,
}

/// Defaults applied to submitted jobs and the retry policy of the pool.
#[derive(Debug, Deserialize, Clone)]
pub struct PoolSettings {
    /// Lease length for jobs submitted without an explicit timeout.
    pub default_timeout_seconds: i32,
    /// Retry ceiling; a job claimed this many times is failed permanently on its next failure.
    pub max_attempts: i32,
    pub retry_backoff_seconds: i64,
    pub retry_backoff_cap_seconds: i64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkerSettings {
    /// Identifier written to `claimed_by`. Defaults to the host name.
    #[serde(default)]
    pub machine_id: Option<String>,
    pub job_types: Vec<JobType>,
    /// How many jobs one claim takes. Bounds how much work a crashed worker strands.
    pub batch_size: u32,
    /// Concurrent fetches within a batch.
    pub concurrency: usize,
    pub idle_sleep_ms: u64,
    /// Consecutive failed claim attempts before the worker gives up.
    pub max_pool_failures: u32,
    /// Run `requeue_expired` every this many idle polls. 0 disables it.
    pub requeue_every_idle: u32,
    /// Leases with less than this left are abandoned instead of reported.
    pub lease_margin_seconds: i64,
    /// Complete fetch jobs whose artifact already exists without downloading again.
    #[serde(default = "default_true")]
    pub skip_existing: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ObjectStoreBackend {
    Local,
    S3,
    Memory,
}

/// An object store location, used both for artifact storage and blob-storage sources.
#[derive(Debug, Deserialize, Clone)]
pub struct ObjectStoreSettings {
    pub backend: ObjectStoreBackend,
    /// Root folder for the `local` backend.
    #[serde(default)]
    pub root: Option<PathBuf>,
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub region: Option<String>,
    /// Custom endpoint for S3-compatible services (R2, MinIO, ...).
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub access_key_id: Option<String>,
    #[serde(default)]
    pub secret_access_key: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    MirrorArchive,
    BlobStorage,
    DirectSite,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceSettings {
    pub name: String,
    pub kind: SourceKind,
    pub priority: i32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// URL with `{dataset}`, `{item}` and `{file_name}` placeholders. HTTP sources only.
    #[serde(default)]
    pub url_template: Option<String>,
    pub timeout_seconds: u64,
    /// The origin honours `Range` requests, so a cheap probe can precede the download.
    #[serde(default)]
    pub range_fetch: bool,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub cookie: Option<String>,
    /// Bucket to read from. Blob-storage sources only.
    #[serde(default)]
    pub blob: Option<ObjectStoreSettings>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CapacitySettings {
    pub reserve_cores: usize,
    pub memory_headroom_mb: u64,
    pub per_job_memory_mb: u64,
    pub max_cap: usize,
    pub jobs_per_instance: usize,
    pub worker_binary: PathBuf,
    #[serde(default)]
    pub worker_args: Vec<String>,
}

/// Location of progress markers written by manual runs before the shared pool existed.
#[derive(Debug, Deserialize, Clone)]
pub struct LegacySettings {
    pub progress_dir: PathBuf,
}

const fn default_true() -> bool {
    true
}
