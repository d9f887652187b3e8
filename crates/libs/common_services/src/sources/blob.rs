use crate::sources::validate::check_expectations;
use crate::sources::{
    FailureReason, FetchRequest, Payload, SourceAdapter, SourceCapabilities, SourceDescriptor,
};
use crate::storage::{ArtifactStore, StorageError};
use app_state::{SourceKind, SourceSettings};
use async_trait::async_trait;
use color_eyre::eyre::eyre;
use std::time::Duration;

/// A bucket somebody already mirrored the documents into, laid out by artifact key.
#[derive(Debug, Clone)]
pub struct BlobStorageAdapter {
    descriptor: SourceDescriptor,
    store: ArtifactStore,
    timeout: Duration,
}

impl BlobStorageAdapter {
    #[must_use]
    pub fn new(descriptor: SourceDescriptor, store: ArtifactStore, timeout: Duration) -> Self {
        Self {
            descriptor,
            store,
            timeout,
        }
    }

    pub fn from_settings(settings: &SourceSettings) -> color_eyre::Result<Self> {
        let blob = settings
            .blob
            .as_ref()
            .ok_or_else(|| eyre!("Source '{}' has no blob section", settings.name))?;
        let descriptor = SourceDescriptor {
            name: settings.name.clone(),
            kind: SourceKind::BlobStorage,
            priority: settings.priority,
            capabilities: SourceCapabilities {
                range_fetch: true,
                checksum: false,
            },
        };
        Ok(Self::new(
            descriptor,
            ArtifactStore::from_settings(blob)?,
            Duration::from_secs(settings.timeout_seconds),
        ))
    }
}

#[async_trait]
impl SourceAdapter for BlobStorageAdapter {
    fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<Payload, FailureReason> {
        let bytes = tokio::time::timeout(self.timeout, self.store.get(&request.artifact_key))
            .await
            .map_err(|_| FailureReason::Timeout)?
            .map_err(|e| match e {
                StorageError::Backend(object_store::Error::NotFound { .. }) => FailureReason::NotFound,
                other => FailureReason::Transport(other.to_string()),
            })?
            .ok_or(FailureReason::NotFound)?;
        check_expectations(request, &bytes)?;
        Ok(Payload::new(bytes))
    }
}
