use app_state::{ObjectStoreBackend, ObjectStoreSettings};
use bytes::Bytes;
use futures_util::TryStreamExt;
use object_store::ObjectStore;
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path as StorePath;
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Failed to write artifact '{key}': {source}")]
    WriteFailure {
        key: String,
        #[source]
        source: object_store::Error,
    },

    #[error("Object store error: {0}")]
    Backend(#[from] object_store::Error),

    #[error("Object store not configured: {0}")]
    NotConfigured(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Builds the object store described by `settings`: a local folder, an S3-compatible bucket, or memory.
pub fn build_object_store(settings: &ObjectStoreSettings) -> Result<Arc<dyn ObjectStore>, StorageError> {
    match settings.backend {
        ObjectStoreBackend::Local => {
            let root = settings
                .root
                .as_ref()
                .ok_or_else(|| StorageError::NotConfigured("local backend without a root".to_owned()))?;
            std::fs::create_dir_all(root)?;
            let store = LocalFileSystem::new_with_prefix(root)?;
            info!("Storage: local backend at {}", root.display());
            Ok(Arc::new(store))
        }
        ObjectStoreBackend::S3 => {
            let bucket = settings
                .bucket
                .as_deref()
                .ok_or_else(|| StorageError::NotConfigured("s3 backend without a bucket".to_owned()))?;
            let mut builder = AmazonS3Builder::from_env().with_bucket_name(bucket);
            if let Some(region) = &settings.region {
                builder = builder.with_region(region);
            }
            if let Some(endpoint) = settings.endpoint.as_deref().filter(|e| !e.is_empty()) {
                let endpoint = if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
                    endpoint.to_owned()
                } else {
                    format!("https://{endpoint}")
                };
                builder = builder
                    .with_allow_http(endpoint.starts_with("http://"))
                    .with_endpoint(endpoint);
            }
            if let Some(key) = &settings.access_key_id {
                builder = builder.with_access_key_id(key);
            }
            if let Some(secret) = &settings.secret_access_key {
                builder = builder.with_secret_access_key(secret);
            }
            let store = builder.build()?;
            info!("Storage: S3 backend s3://{bucket}/{}", settings.prefix);
            Ok(Arc::new(store))
        }
        ObjectStoreBackend::Memory => {
            info!("Storage: in-memory backend, nothing is persisted");
            Ok(Arc::new(InMemory::new()))
        }
    }
}

/// Where fetched documents end up, keyed by their artifact key (`{dataset}/EFTA{n}.pdf`).
///
/// Writes are idempotent overwrites, so a job that runs twice stores the same object twice.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    store: Arc<dyn ObjectStore>,
    prefix: String,
}

impl ArtifactStore {
    #[must_use]
    pub fn new(store: Arc<dyn ObjectStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into().trim_matches('/').to_owned(),
        }
    }

    pub fn from_settings(settings: &ObjectStoreSettings) -> Result<Self, StorageError> {
        Ok(Self::new(build_object_store(settings)?, settings.prefix.clone()))
    }

    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemory::new()), "")
    }

    fn path(&self, key: &str) -> StorePath {
        let key = key.trim_start_matches('/');
        if self.prefix.is_empty() {
            StorePath::from(key)
        } else {
            StorePath::from(format!("{}/{key}", self.prefix))
        }
    }

    pub async fn put(&self, key: &str, bytes: Bytes) -> Result<(), StorageError> {
        let len = bytes.len();
        self.store
            .put(&self.path(key), bytes.into())
            .await
            .map_err(|source| StorageError::WriteFailure {
                key: key.to_owned(),
                source,
            })?;
        debug!("Stored {key} ({len} bytes)");
        Ok(())
    }

    /// Reads an object. Missing objects are `None`, not an error.
    pub async fn get(&self, key: &str) -> Result<Option<Bytes>, StorageError> {
        match self.store.get(&self.path(key)).await {
            Ok(result) => Ok(Some(result.bytes().await?)),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        match self.store.head(&self.path(key)).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn delete(&self, key: &str) -> Result<(), StorageError> {
        match self.store.delete(&self.path(key)).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Every key under this store's prefix, relative to it.
    pub async fn list_keys(&self) -> Result<BTreeSet<String>, StorageError> {
        let list_prefix = (!self.prefix.is_empty()).then(|| StorePath::from(self.prefix.as_str()));
        let strip = if self.prefix.is_empty() {
            String::new()
        } else {
            format!("{}/", self.prefix)
        };

        let mut keys = BTreeSet::new();
        let mut stream = self.store.list(list_prefix.as_ref());
        while let Some(meta) = stream.try_next().await? {
            let location = meta.location.as_ref();
            let key = location.strip_prefix(strip.as_str()).unwrap_or(location);
            keys.insert(key.to_owned());
        }
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use color_eyre::Result;

    #[tokio::test]
    async fn put_then_find_under_prefix() -> Result<()> {
        let backing: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let store = ArtifactStore::new(Arc::clone(&backing), "/mirror/");
        store.put("DataSet 1/EFTA00000001.pdf", Bytes::from_static(b"%PDF-1.7")).await?;

        assert!(store.exists("DataSet 1/EFTA00000001.pdf").await?);
        assert!(!store.exists("DataSet 1/EFTA00000002.pdf").await?);
        assert_eq!(
            store.get("DataSet 1/EFTA00000001.pdf").await?,
            Some(Bytes::from_static(b"%PDF-1.7"))
        );

        let raw = backing.head(&StorePath::from("mirror/DataSet 1/EFTA00000001.pdf")).await;
        assert!(raw.is_ok(), "object lives under the configured prefix");

        let keys: Vec<_> = store.list_keys().await?.into_iter().collect();
        assert_eq!(keys, ["DataSet 1/EFTA00000001.pdf"]);
        Ok(())
    }

    #[tokio::test]
    async fn local_backend_writes_into_root() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let settings = ObjectStoreSettings {
            backend: ObjectStoreBackend::Local,
            root: Some(dir.path().join("artifacts")),
            bucket: None,
            prefix: String::new(),
            region: None,
            endpoint: None,
            access_key_id: None,
            secret_access_key: None,
        };
        let store = ArtifactStore::from_settings(&settings)?;
        store.put("DataSet 2/EFTA00000042.pdf", Bytes::from_static(b"%PDF-1.4")).await?;

        assert!(dir.path().join("artifacts/DataSet 2/EFTA00000042.pdf").is_file());
        assert_eq!(store.list_keys().await?.len(), 1);

        store.delete("DataSet 2/EFTA00000042.pdf").await?;
        store.delete("DataSet 2/EFTA00000042.pdf").await?;
        assert!(store.list_keys().await?.is_empty());
        Ok(())
    }

    #[test]
    fn s3_without_bucket_is_not_configured() {
        let settings = ObjectStoreSettings {
            backend: ObjectStoreBackend::S3,
            root: None,
            bucket: None,
            prefix: String::new(),
            region: None,
            endpoint: None,
            access_key_id: None,
            secret_access_key: None,
        };
        assert!(matches!(
            build_object_store(&settings),
            Err(StorageError::NotConfigured(_))
        ));
    }
}
