use crate::reconcile::{ProgressReconciler, ReconcileError};
use chrono::{DateTime, Utc};
use common_types::FetchPayload;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Progress marker written by the single-machine scraper, one file per dataset.
#[derive(Debug, Clone, Deserialize)]
pub struct LegacyProgress {
    pub dataset: String,
    #[serde(default)]
    pub completed: Vec<u64>,
    #[serde(default)]
    pub failed: Vec<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LegacyReport {
    pub files: usize,
    /// Completed items whose artifact exists, recorded as done.
    pub backfilled: u64,
    /// Items queued as pending: failed ones, and completed ones whose artifact is missing.
    pub submitted: u64,
    /// Completed items whose artifact was missing.
    pub missing_artifacts: usize,
}

async fn read_progress_files(dir: &Path) -> Result<Vec<(PathBuf, LegacyProgress)>, ReconcileError> {
    let io_err = |source| ReconcileError::Io {
        path: dir.to_path_buf(),
        source,
    };
    let mut entries = tokio::fs::read_dir(dir).await.map_err(io_err)?;
    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("json")) {
            paths.push(path);
        }
    }
    paths.sort();

    let mut files = Vec::with_capacity(paths.len());
    for path in paths {
        let text = tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| ReconcileError::Io {
                path: path.clone(),
                source,
            })?;
        let progress = serde_json::from_str(&text).map_err(|source| ReconcileError::MalformedProgress {
            path: path.clone(),
            source,
        })?;
        files.push((path, progress));
    }
    Ok(files)
}

impl ProgressReconciler {
    /// Imports progress markers from before the shared pool existed.
    ///
    /// A marker is only trusted when the artifact it points at is in storage. Everything else is queued.
    pub async fn migrate_legacy(&self, dir: &Path, now: DateTime<Utc>) -> Result<LegacyReport, ReconcileError> {
        let files = read_progress_files(dir).await?;
        let keys = self.store.list_keys().await?;
        let mut report = LegacyReport {
            files: files.len(),
            ..LegacyReport::default()
        };

        for (path, progress) in files {
            let mut done = Vec::new();
            let mut pending = Vec::new();
            for number in &progress.completed {
                let payload = FetchPayload::new(progress.dataset.clone(), *number);
                if keys.contains(&payload.artifact_key()) {
                    done.push(self.defaults.job(payload));
                } else {
                    report.missing_artifacts += 1;
                    pending.push(self.defaults.job(payload));
                }
            }
            pending.extend(
                progress
                    .failed
                    .iter()
                    .map(|number| self.defaults.job(FetchPayload::new(progress.dataset.clone(), *number))),
            );

            if done.len() < progress.completed.len() {
                warn!(
                    "{}: {} completed items have no artifact, queueing them",
                    path.display(),
                    progress.completed.len() - done.len()
                );
            }
            report.backfilled += self.pool.backfill_done(done, now).await?;
            report.submitted += self.pool.submit_many(pending).await?;
            info!("Imported {} ({})", path.display(), progress.dataset);
        }
        Ok(report)
    }
}
