use crate::handlers::{HandlerError, JobHandler, JobResult};
use async_trait::async_trait;
use common_services::sources::{FetchRequest, SourceRegistry};
use common_services::storage::ArtifactStore;
use common_types::{JobPayload, JobType};
use tracing::{debug, info};

/// Downloads one document through the source registry and stores it under its artifact key.
pub struct FetchHandler {
    sources: SourceRegistry,
    store: ArtifactStore,
    skip_existing: bool,
}

impl FetchHandler {
    #[must_use]
    pub const fn new(sources: SourceRegistry, store: ArtifactStore, skip_existing: bool) -> Self {
        Self {
            sources,
            store,
            skip_existing,
        }
    }
}

#[async_trait]
impl JobHandler for FetchHandler {
    fn job_type(&self) -> JobType {
        JobType::Fetch
    }

    async fn handle(&self, payload: &JobPayload) -> Result<JobResult, HandlerError> {
        let JobPayload::Fetch(fetch) = payload else {
            return Err(HandlerError::Permanent(format!(
                "Fetch handler got a {} payload",
                payload.job_type()
            )));
        };
        let key = fetch.artifact_key();

        if self.skip_existing {
            let exists = self
                .store
                .exists(&key)
                .await
                .map_err(|e| HandlerError::Retryable(e.to_string()))?;
            if exists {
                debug!("{key} already stored, skipping download");
                return Ok(JobResult::Skipped);
            }
        }

        let fetched = self
            .sources
            .resolve(&FetchRequest::from(fetch))
            .await
            .map_err(|e| HandlerError::Retryable(e.to_string()))?;

        // The artifact must be durable before the job may be reported done.
        self.store
            .put(&key, fetched.bytes)
            .await
            .map_err(|e| HandlerError::Retryable(e.to_string()))?;

        info!(
            "Stored {key} from {} ({} bytes, blake3 {})",
            fetched.source, fetched.len, fetched.content_hash
        );
        Ok(JobResult::Done)
    }
}
