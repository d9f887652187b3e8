use async_trait::async_trait;
use common_types::{JobPayload, JobType};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

pub mod fetch;

/// The outcome of a successful handler run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobResult {
    Done,
    /// Nothing to do, the result already existed.
    Skipped,
}

#[derive(Debug, Error)]
pub enum HandlerError {
    /// Worth another attempt, possibly on another machine.
    #[error("{0}")]
    Retryable(String),

    /// Retrying can't help, e.g. the payload is malformed.
    #[error("{0}")]
    Permanent(String),
}

impl HandlerError {
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    fn job_type(&self) -> JobType;

    async fn handle(&self, payload: &JobPayload) -> Result<JobResult, HandlerError>;
}

/// Maps job types to their handlers. Built once at startup; the worker only claims what's in here.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: BTreeMap<JobType, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    #[must_use]
    pub fn with(mut self, handler: Arc<dyn JobHandler>) -> Self {
        self.handlers.insert(handler.job_type(), handler);
        self
    }

    #[must_use]
    pub fn get(&self, job_type: JobType) -> Option<&Arc<dyn JobHandler>> {
        self.handlers.get(&job_type)
    }

    #[must_use]
    pub fn job_types(&self) -> Vec<JobType> {
        self.handlers.keys().copied().collect()
    }

    /// Dispatches a decoded payload to the handler of its job type.
    pub async fn handle(&self, payload: &JobPayload) -> Result<JobResult, HandlerError> {
        let job_type = payload.job_type();
        let handler = self
            .get(job_type)
            .ok_or_else(|| HandlerError::Permanent(format!("No handler for {job_type} jobs")))?;
        handler.handle(payload).await
    }
}
