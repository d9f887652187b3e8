use crate::JobType;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Payload of a `fetch` job: one EFTA document of one dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchPayload {
    pub dataset: String,
    pub efta_number: u64,
    /// Size in bytes, when the scraper saw it in the listing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_size: Option<u64>,
    /// blake3 hex digest, when known from an earlier mirror manifest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_hash: Option<String>,
}

impl FetchPayload {
    #[must_use]
    pub fn new(dataset: impl Into<String>, efta_number: u64) -> Self {
        Self {
            dataset: dataset.into(),
            efta_number,
            expected_size: None,
            expected_hash: None,
        }
    }

    /// Logical item key, e.g. `EFTA00039025`.
    #[must_use]
    pub fn item_key(&self) -> String {
        format!("EFTA{:08}", self.efta_number)
    }

    #[must_use]
    pub fn file_name(&self) -> String {
        format!("{}.pdf", self.item_key())
    }

    /// Deterministic storage key: `{dataset}/EFTA{number:08}.pdf`.
    #[must_use]
    pub fn artifact_key(&self) -> String {
        format!("{}/{}", self.dataset, self.file_name())
    }

    /// Inverse of [`Self::artifact_key`]. Keys that don't look like an EFTA document, or that
    /// [`Self::artifact_key`] would spell differently (e.g. extra zero padding), yield `None`.
    #[must_use]
    pub fn from_artifact_key(key: &str) -> Option<Self> {
        let key = key.trim_start_matches('/');
        let (dataset, file_name) = key.rsplit_once('/')?;
        let digits = file_name.strip_prefix("EFTA")?.strip_suffix(".pdf")?;
        if dataset.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let payload = Self::new(dataset, digits.parse().ok()?);
        (payload.artifact_key() == key).then_some(payload)
    }
}

/// Payload of downstream processing jobs that work on an already stored document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentPayload {
    pub document_id: String,
}

/// A decoded job payload. The variant always agrees with the row's `job_type`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobPayload {
    Fetch(FetchPayload),
    ChunkEmbed(DocumentPayload),
    Ocr(DocumentPayload),
}

impl JobPayload {
    /// Interprets a stored JSON payload according to its job type.
    pub fn decode(job_type: JobType, payload: &Value) -> Result<Self, serde_json::Error> {
        let value = payload.clone();
        Ok(match job_type {
            JobType::Fetch => Self::Fetch(serde_json::from_value(value)?),
            JobType::ChunkEmbed => Self::ChunkEmbed(serde_json::from_value(value)?),
            JobType::Ocr => Self::Ocr(serde_json::from_value(value)?),
        })
    }

    #[must_use]
    pub const fn job_type(&self) -> JobType {
        match self {
            Self::Fetch(_) => JobType::Fetch,
            Self::ChunkEmbed(_) => JobType::ChunkEmbed,
            Self::Ocr(_) => JobType::Ocr,
        }
    }

    /// Logical identity used to deduplicate submissions of the same work.
    #[must_use]
    pub fn dedupe_key(&self) -> String {
        match self {
            Self::Fetch(p) => p.artifact_key(),
            Self::ChunkEmbed(p) | Self::Ocr(p) => p.document_id.clone(),
        }
    }

    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        match self {
            Self::Fetch(p) => serde_json::to_value(p),
            Self::ChunkEmbed(p) | Self::Ocr(p) => serde_json::to_value(p),
        }
    }
}

impl From<FetchPayload> for JobPayload {
    fn from(payload: FetchPayload) -> Self {
        Self::Fetch(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn artifact_key_is_zero_padded() {
        let payload = FetchPayload::new("DataSet 8", 39025);
        assert_eq!(payload.item_key(), "EFTA00039025");
        assert_eq!(payload.artifact_key(), "DataSet 8/EFTA00039025.pdf");
        assert_eq!(FetchPayload::from_artifact_key(&payload.artifact_key()), Some(payload));
    }

    #[test]
    fn foreign_keys_are_not_fetch_artifacts() {
        assert_eq!(FetchPayload::from_artifact_key("DataSet 8/notes.txt"), None);
        assert_eq!(FetchPayload::from_artifact_key("EFTA00000001.pdf"), None);
        assert_eq!(FetchPayload::from_artifact_key("DataSet 8/EFTA12.pdf"), None);
        assert_eq!(FetchPayload::from_artifact_key("DataSet 8/EFTA0000000x.pdf"), None);
    }

    #[test]
    fn only_canonical_spellings_are_artifacts() {
        // Would be recorded under `EFTA00000001.pdf` and backfilled again on every sync.
        assert_eq!(FetchPayload::from_artifact_key("DataSet 8/EFTA000000001.pdf"), None);

        let wide = FetchPayload::new("DataSet 8", 123_456_789);
        assert_eq!(FetchPayload::from_artifact_key("DataSet 8/EFTA123456789.pdf"), Some(wide));
        assert_eq!(
            FetchPayload::from_artifact_key("/DataSet 8/EFTA00000001.pdf"),
            Some(FetchPayload::new("DataSet 8", 1))
        );
    }

    #[test]
    fn decode_follows_job_type() {
        let fetch = JobPayload::decode(JobType::Fetch, &json!({"dataset": "DataSet 1", "efta_number": 3}))
            .expect("valid fetch payload");
        assert_eq!(fetch.job_type(), JobType::Fetch);
        assert_eq!(fetch.dedupe_key(), "DataSet 1/EFTA00000003.pdf");

        let ocr = JobPayload::decode(JobType::Ocr, &json!({"document_id": "doc-9"})).expect("valid ocr payload");
        assert_eq!(ocr.dedupe_key(), "doc-9");

        assert!(JobPayload::decode(JobType::Fetch, &json!({"document_id": "doc-9"})).is_err());
    }

    #[test]
    fn optional_fields_are_omitted_from_json() {
        let value = JobPayload::from(FetchPayload::new("DataSet 2", 4))
            .to_value()
            .expect("serializable");
        assert_eq!(value, json!({"dataset": "DataSet 2", "efta_number": 4}));
    }
}
