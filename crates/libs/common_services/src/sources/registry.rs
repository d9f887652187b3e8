use crate::sources::validate::content_hash;
use crate::sources::{
    AdapterFailure, AllSourcesExhausted, BlobStorageAdapter, DirectSiteAdapter, FetchRequest, Fetched,
    MirrorArchiveAdapter, SourceAdapter,
};
use app_state::{SourceKind, SourceSettings};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Ordered list of origins. Adding an origin means adding an adapter, nothing else changes.
#[derive(Clone, Default)]
pub struct SourceRegistry {
    adapters: Vec<Arc<dyn SourceAdapter>>,
}

impl SourceRegistry {
    /// Adapters are tried in ascending priority; equal priorities keep their given order.
    #[must_use]
    pub fn new(mut adapters: Vec<Arc<dyn SourceAdapter>>) -> Self {
        adapters.sort_by_key(|a| a.descriptor().priority);
        Self { adapters }
    }

    pub fn from_settings(sources: &[SourceSettings]) -> color_eyre::Result<Self> {
        let mut adapters: Vec<Arc<dyn SourceAdapter>> = Vec::with_capacity(sources.len());
        for source in sources.iter().filter(|s| s.enabled) {
            let adapter: Arc<dyn SourceAdapter> = match source.kind {
                SourceKind::MirrorArchive => Arc::new(MirrorArchiveAdapter::from_settings(source)?),
                SourceKind::BlobStorage => Arc::new(BlobStorageAdapter::from_settings(source)?),
                SourceKind::DirectSite => Arc::new(DirectSiteAdapter::from_settings(source)?),
            };
            adapters.push(adapter);
        }
        let registry = Self::new(adapters);
        info!("Source order: {}", registry.names().join(" -> "));
        Ok(registry)
    }

    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.adapters.iter().map(|a| a.descriptor().name.as_str()).collect()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    /// Tries each adapter once, in order, and returns the first body that passes its checks.
    pub async fn resolve(&self, request: &FetchRequest) -> Result<Fetched, AllSourcesExhausted> {
        let mut failures = Vec::new();
        for adapter in &self.adapters {
            let name = &adapter.descriptor().name;
            match adapter.fetch(request).await {
                Ok(payload) => {
                    let len = payload.bytes.len() as u64;
                    debug!("{} resolved from {name} ({len} bytes)", request.item_key);
                    return Ok(Fetched {
                        source: name.clone(),
                        content_hash: content_hash(&payload.bytes),
                        bytes: payload.bytes,
                        len,
                        failures,
                    });
                }
                Err(reason) => {
                    warn!("{} not available from {name}: {reason}", request.item_key);
                    failures.push(AdapterFailure {
                        adapter: name.clone(),
                        reason,
                    });
                }
            }
        }
        Err(AllSourcesExhausted {
            item_key: request.item_key.clone(),
            failures,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::{FailureReason, Payload, SourceCapabilities, SourceDescriptor};
    use async_trait::async_trait;
    use color_eyre::Result;
    use common_types::FetchPayload;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedAdapter {
        descriptor: SourceDescriptor,
        outcome: Result<&'static [u8], FailureReason>,
        calls: AtomicUsize,
    }

    impl ScriptedAdapter {
        fn new(name: &str, priority: i32, outcome: Result<&'static [u8], FailureReason>) -> Arc<Self> {
            Arc::new(Self {
                descriptor: SourceDescriptor {
                    name: name.to_owned(),
                    kind: SourceKind::MirrorArchive,
                    priority,
                    capabilities: SourceCapabilities::default(),
                },
                outcome,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl SourceAdapter for ScriptedAdapter {
        fn descriptor(&self) -> &SourceDescriptor {
            &self.descriptor
        }

        async fn fetch(&self, _request: &FetchRequest) -> Result<Payload, FailureReason> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.outcome.clone().map(Payload::new)
        }
    }

    fn request() -> FetchRequest {
        FetchRequest::from(&FetchPayload::new("DataSet 1", 1))
    }

    #[tokio::test]
    async fn falls_back_in_priority_order() -> Result<()> {
        let direct = ScriptedAdapter::new("direct", 30, Ok(b"%PDF-direct"));
        let mirror = ScriptedAdapter::new("mirror", 10, Err(FailureReason::NotFound));
        let blob = ScriptedAdapter::new("blob", 20, Ok(b"%PDF-blob"));
        let adapters: Vec<Arc<dyn SourceAdapter>> = vec![direct.clone(), mirror.clone(), blob];
        let registry = SourceRegistry::new(adapters);
        assert_eq!(registry.names(), ["mirror", "blob", "direct"]);

        let fetched = registry.resolve(&request()).await?;

        assert_eq!(fetched.source, "blob");
        assert_eq!(fetched.bytes.as_ref(), b"%PDF-blob");
        assert_eq!(fetched.len, 9);
        assert_eq!(fetched.content_hash, content_hash(b"%PDF-blob"));
        assert_eq!(
            fetched.failures,
            vec![AdapterFailure {
                adapter: "mirror".to_owned(),
                reason: FailureReason::NotFound
            }]
        );
        assert_eq!(direct.calls.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[tokio::test]
    async fn exhaustion_reports_each_adapter_once() {
        let first = ScriptedAdapter::new("first", 1, Err(FailureReason::Timeout));
        let second = ScriptedAdapter::new("second", 2, Err(FailureReason::Http(503)));
        let adapters: Vec<Arc<dyn SourceAdapter>> = vec![second.clone(), first.clone()];
        let registry = SourceRegistry::new(adapters);

        let err = registry.resolve(&request()).await.expect_err("every source fails");

        assert_eq!(err.item_key, "EFTA00000001");
        let reasons: Vec<_> = err.failures.iter().map(|f| (f.adapter.as_str(), f.reason.clone())).collect();
        assert_eq!(
            reasons,
            [("first", FailureReason::Timeout), ("second", FailureReason::Http(503))]
        );
        assert_eq!(first.calls.load(Ordering::SeqCst), 1);
        assert_eq!(second.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_registry_is_exhausted_immediately() {
        let err = SourceRegistry::default().resolve(&request()).await.expect_err("no sources");
        assert!(err.failures.is_empty());
    }
}
