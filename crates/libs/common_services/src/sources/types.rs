use app_state::SourceKind;
use bytes::Bytes;
use common_types::FetchPayload;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceCapabilities {
    /// Honours `Range` requests.
    pub range_fetch: bool,
    /// Can verify a body against an expected digest.
    pub checksum: bool,
}

/// Static description of one origin. Owned by the registry, never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDescriptor {
    pub name: String,
    pub kind: SourceKind,
    /// Lower is tried first.
    pub priority: i32,
    pub capabilities: SourceCapabilities,
}

/// What to fetch, derived from a fetch job's payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub dataset: String,
    pub item_key: String,
    pub file_name: String,
    pub artifact_key: String,
    pub expected_size: Option<u64>,
    pub expected_hash: Option<String>,
}

impl From<&FetchPayload> for FetchRequest {
    fn from(payload: &FetchPayload) -> Self {
        Self {
            dataset: payload.dataset.clone(),
            item_key: payload.item_key(),
            file_name: payload.file_name(),
            artifact_key: payload.artifact_key(),
            expected_size: payload.expected_size,
            expected_hash: payload.expected_hash.clone(),
        }
    }
}

/// Raw body returned by an adapter before the registry accepts it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub bytes: Bytes,
    pub content_type: Option<String>,
}

impl Payload {
    #[must_use]
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
            content_type: None,
        }
    }
}

/// Why one adapter could not deliver an item.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FailureReason {
    #[error("timed out")]
    Timeout,
    #[error("not found")]
    NotFound,
    #[error("rate limited")]
    RateLimited,
    #[error("HTTP status {0}")]
    Http(u16),
    #[error("corrupt payload: {0}")]
    Corrupt(String),
    #[error("transport error: {0}")]
    Transport(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterFailure {
    pub adapter: String,
    pub reason: FailureReason,
}

impl fmt::Display for AdapterFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.adapter, self.reason)
    }
}

/// A successfully resolved item.
#[derive(Debug, Clone)]
pub struct Fetched {
    /// Name of the adapter that delivered the bytes.
    pub source: String,
    pub bytes: Bytes,
    pub len: u64,
    /// blake3 hex digest of `bytes`.
    pub content_hash: String,
    /// Adapters tried before the successful one, in the order they were tried.
    pub failures: Vec<AdapterFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("All sources exhausted for {item_key}: [{}]", join_failures(.failures))]
pub struct AllSourcesExhausted {
    pub item_key: String,
    pub failures: Vec<AdapterFailure>,
}

fn join_failures(failures: &[AdapterFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
