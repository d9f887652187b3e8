//! Origins a document can be fetched from, and the ordered fallback across them.

mod blob;
mod http;
mod registry;
mod types;
mod validate;

pub use blob::*;
pub use http::*;
pub use registry::*;
pub use types::*;
pub use validate::{content_hash, is_pdf};

use async_trait::async_trait;

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn descriptor(&self) -> &SourceDescriptor;

    /// Fetches and validates one item. Each call is a single attempt; retrying is the caller's business.
    async fn fetch(&self, request: &FetchRequest) -> Result<Payload, FailureReason>;
}
