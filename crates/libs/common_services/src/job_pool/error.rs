use thiserror::Error;

#[derive(Debug, Error)]
pub enum PoolError {
    /// The lease no longer owns the row: it expired and was reclaimed, or the row moved on.
    #[error("Stale claim on job {job_id}: the lease no longer holds it")]
    StaleClaim { job_id: i64 },

    #[error("Job {0} does not exist")]
    NotFound(i64),

    /// The backing store can't be reached. Retry the whole claim cycle later.
    #[error("Job pool unavailable: {0}")]
    Unavailable(String),

    #[error("Database error: {0}")]
    Database(sqlx::Error),

    #[error("JSON serialization error: {0}")]
    Payload(#[from] serde_json::Error),
}

impl PoolError {
    #[must_use]
    pub const fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }

    #[must_use]
    pub const fn is_stale_claim(&self) -> bool {
        matches!(self, Self::StaleClaim { .. })
    }
}

impl From<sqlx::Error> for PoolError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => Self::Unavailable(err.to_string()),
            other => Self::Database(other),
        }
    }
}
