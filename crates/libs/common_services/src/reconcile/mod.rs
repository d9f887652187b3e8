//! Keeps the pool's view of finished fetches in line with what is actually in storage.

mod legacy;

pub use legacy::*;

use crate::job_pool::{JobDefaults, JobPool, PoolError};
use crate::storage::{ArtifactStore, StorageError};
use chrono::{DateTime, Utc};
use common_types::{FetchPayload, JobStatus, JobType};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

const PAGE_SIZE: u32 = 1000;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("Job pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed progress file {path}: {source}")]
    MalformedProgress {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Artifact keys found in storage.
    pub artifacts: usize,
    /// `done` fetch items seen in the pool.
    pub done_items: usize,
    /// `done` items whose artifact was gone, now `pending` again.
    pub reverted: u64,
    /// Artifacts that had no `done` item, now recorded as done.
    pub backfilled: u64,
}

pub struct ProgressReconciler {
    pool: Arc<dyn JobPool>,
    store: ArtifactStore,
    defaults: JobDefaults,
}

impl ProgressReconciler {
    #[must_use]
    pub fn new(pool: Arc<dyn JobPool>, store: ArtifactStore, defaults: JobDefaults) -> Self {
        Self {
            pool,
            store,
            defaults,
        }
    }

    /// Two-way sync between `done` fetch items and stored artifacts.
    ///
    /// Storage is listed once, up front. A `done` item missing from that listing is checked again
    /// before it is reverted, so an item completed while the sync runs keeps its status.
    pub async fn sync(&self, now: DateTime<Utc>) -> Result<SyncReport, ReconcileError> {
        let keys = self.store.list_keys().await?;
        info!("Reconciling against {} stored artifacts", keys.len());

        let mut done_keys = HashSet::new();
        let mut unlisted = Vec::new();
        let mut after_id = 0;
        loop {
            let page = self
                .pool
                .list_items(JobType::Fetch, JobStatus::Done, after_id, PAGE_SIZE)
                .await?;
            let Some(last) = page.last() else {
                break;
            };
            after_id = last.id;
            for item in page {
                if keys.contains(&item.dedupe_key) {
                    done_keys.insert(item.dedupe_key);
                } else {
                    unlisted.push((item.id, item.dedupe_key));
                }
            }
        }
        let done_items = done_keys.len() + unlisted.len();

        // The listing is older than the page; a worker may have stored and completed since.
        let mut missing = Vec::with_capacity(unlisted.len());
        for (id, key) in unlisted {
            if self.store.exists(&key).await? {
                done_keys.insert(key);
            } else {
                missing.push(id);
            }
        }

        let reverted = if missing.is_empty() {
            0
        } else {
            warn!("{} done items have no artifact, returning them to pending", missing.len());
            self.pool
                .revert_to_pending(&missing, "artifact missing from storage")
                .await?
        };

        let backfilled = self
            .backfill(keys.iter().filter(|k| !done_keys.contains(*k)), now)
            .await?;

        let report = SyncReport {
            artifacts: keys.len(),
            done_items,
            reverted,
            backfilled,
        };
        info!(
            "Sync finished: {} artifacts, {} done items, {} reverted, {} backfilled",
            report.artifacts, report.done_items, report.reverted, report.backfilled
        );
        Ok(report)
    }

    /// Records the given artifact keys as done fetch items. Keys that don't name a document are skipped.
    async fn backfill<'a>(
        &self,
        keys: impl Iterator<Item = &'a String>,
        now: DateTime<Utc>,
    ) -> Result<u64, ReconcileError> {
        let jobs: Vec<_> = keys
            .filter_map(|key| {
                let payload = FetchPayload::from_artifact_key(key);
                if payload.is_none() {
                    warn!("Ignoring stored object '{key}', it is not a document artifact");
                }
                payload
            })
            .map(|payload| self.defaults.job(payload))
            .collect();

        let mut backfilled = 0;
        for chunk in jobs.chunks(PAGE_SIZE as usize) {
            backfilled += self.pool.backfill_done(chunk.to_vec(), now).await?;
        }
        Ok(backfilled)
    }
}
