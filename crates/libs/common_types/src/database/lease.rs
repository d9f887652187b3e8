use crate::{JobItem, JobStatus};
use chrono::{DateTime, Duration, Utc};

/// Exclusive, time-bounded ownership of one claimed job.
///
/// `claimed_at` is the fencing token: once a row is reclaimed by someone else its
/// `claimed_at` changes, and any `complete`/`fail` presented with the old lease is stale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerLease {
    pub job_id: i64,
    pub machine_id: String,
    pub claimed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl WorkerLease {
    /// Builds the lease for a job returned by a claim. Returns `None` for rows that are not claimed.
    #[must_use]
    pub fn from_item(item: &JobItem) -> Option<Self> {
        if item.status != JobStatus::Claimed {
            return None;
        }
        let claimed_at = item.claimed_at?;
        let machine_id = item.claimed_by.clone()?;
        Some(Self {
            job_id: item.id,
            machine_id,
            claimed_at,
            expires_at: claimed_at + Duration::seconds(i64::from(item.timeout_seconds)),
        })
    }

    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// True when less than `margin` of the lease is left. Workers abandon such leases
    /// rather than report on them, since the pool may already have handed the job out again.
    #[must_use]
    pub fn is_nearly_expired(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        now + margin > self.expires_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::JobType;
    use serde_json::json;

    fn claimed_item(claimed_at: DateTime<Utc>) -> JobItem {
        JobItem {
            id: 7,
            job_type: JobType::Fetch,
            payload: json!({"dataset": "DataSet 1", "efta_number": 1}),
            dedupe_key: "DataSet 1/EFTA00000001.pdf".to_owned(),
            status: JobStatus::Claimed,
            priority: 5,
            timeout_seconds: 60,
            attempts: 1,
            max_attempts: 5,
            claimed_by: Some("box-a".to_owned()),
            claimed_at: Some(claimed_at),
            available_at: claimed_at,
            source_machine: "box-a".to_owned(),
            last_error: None,
            created_at: claimed_at,
            finished_at: None,
        }
    }

    #[test]
    fn lease_expires_after_timeout() {
        let now = Utc::now();
        let lease = WorkerLease::from_item(&claimed_item(now)).expect("claimed item has a lease");
        assert_eq!(lease.expires_at, now + Duration::seconds(60));
        assert!(!lease.is_expired(now + Duration::seconds(60)));
        assert!(lease.is_expired(now + Duration::seconds(61)));
        assert!(lease.is_nearly_expired(now + Duration::seconds(55), Duration::seconds(10)));
        assert!(!lease.is_nearly_expired(now + Duration::seconds(10), Duration::seconds(10)));
    }

    #[test]
    fn pending_item_has_no_lease() {
        let mut item = claimed_item(Utc::now());
        item.status = JobStatus::Pending;
        assert!(WorkerLease::from_item(&item).is_none());
    }
}
