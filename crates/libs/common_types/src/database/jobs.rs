use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{FromRow, Type};
use std::fmt;
use std::str::FromStr;

/// A row of the `jobs` table.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize)]
#[allow(clippy::struct_field_names)]
pub struct JobItem {
    pub id: i64,
    pub job_type: JobType,
    pub payload: Value,
    pub dedupe_key: String,
    pub status: JobStatus,
    pub priority: i32,
    pub timeout_seconds: i32,
    pub attempts: i32,
    pub max_attempts: i32,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub available_at: DateTime<Utc>,
    pub source_machine: String,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobItem {
    /// Whether this row is claimed and its lease has run out at `now`.
    #[must_use]
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Claimed
            && self.claimed_at.is_some_and(|claimed_at| {
                now - claimed_at > chrono::Duration::seconds(i64::from(self.timeout_seconds))
            })
    }

    /// Whether another retry is allowed after the current attempt.
    #[must_use]
    pub const fn attempts_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Type, Serialize, Deserialize)]
#[sqlx(type_name = "job_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Fetch,
    ChunkEmbed,
    Ocr,
}

impl JobType {
    pub const ALL: [Self; 3] = [Self::Fetch, Self::ChunkEmbed, Self::Ocr];

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Fetch => "fetch",
            Self::ChunkEmbed => "chunk_embed",
            Self::Ocr => "ocr",
        }
    }

    /// Default priority for newly submitted jobs of this type.
    #[must_use]
    pub const fn default_priority(&self) -> i32 {
        match self {
            Self::Fetch => 50,
            Self::Ocr => 30,
            Self::ChunkEmbed => 20,
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown job type '{0}'")]
pub struct UnknownJobType(pub String);

impl FromStr for JobType {
    type Err = UnknownJobType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "fetch" => Ok(Self::Fetch),
            "chunk_embed" => Ok(Self::ChunkEmbed),
            "ocr" => Ok(Self::Ocr),
            _ => Err(UnknownJobType(s.to_owned())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Type, Serialize, Deserialize)]
#[sqlx(type_name = "job_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Claimed,
    Done,
    Failed,
}

impl JobStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Claimed => "claimed",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate counts per status. Claimed rows are split into live and expired leases.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromRow, Serialize)]
pub struct StatusCounts {
    pub pending: i64,
    pub claimed: i64,
    pub expired: i64,
    pub done: i64,
    pub failed: i64,
}

impl StatusCounts {
    #[must_use]
    pub const fn total(&self) -> i64 {
        self.pending + self.claimed + self.expired + self.done + self.failed
    }
}
