use crate::aggregator::AggregatedEntity;
use crate::job::{Job, JobStatus, Timestamp};
use crate::CrawlError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

pub const CHECKPOINT_FORMAT_VERSION: u32 = 1;

/// Durable snapshot of coordination state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub format_version: u32,
    /// Milliseconds since the Unix epoch when the snapshot was taken
    pub saved_at: Timestamp,
    pub jobs: Vec<Job>,
    pub aggregated_entities: Vec<AggregatedEntity>,
}

impl Checkpoint {
    pub fn new(saved_at: Timestamp, jobs: Vec<Job>, aggregated_entities: Vec<AggregatedEntity>) -> Self {
        Self {
            format_version: CHECKPOINT_FORMAT_VERSION,
            saved_at,
            jobs,
            aggregated_entities,
        }
    }

    /// Check internal consistency. Any violation means the file cannot be trusted
    /// and recovery must stop.
    pub fn validate(&self) -> Result<(), CrawlError> {
        if self.format_version != CHECKPOINT_FORMAT_VERSION {
            return Err(CrawlError::CorruptCheckpoint(format!(
                "unsupported format version {}",
                self.format_version
            )));
        }

        let mut entity_keys = HashSet::new();
        for entity in &self.aggregated_entities {
            if !entity_keys.insert(entity.entity_key.as_str()) {
                return Err(CrawlError::CorruptCheckpoint(format!(
                    "entity {} appears more than once",
                    entity.entity_key
                )));
            }
        }

        let mut job_ids = HashSet::new();
        for job in &self.jobs {
            if !job_ids.insert(job.id.as_str()) {
                return Err(CrawlError::CorruptCheckpoint(format!("job {} appears more than once", job.id)));
            }
            if job.attempt_count > job.max_attempts {
                return Err(CrawlError::CorruptCheckpoint(format!(
                    "job {} has {} attempts, max is {}",
                    job.id, job.attempt_count, job.max_attempts
                )));
            }
            let leased = job.status == JobStatus::Leased;
            if leased != job.lease_owner.is_some() || leased != job.lease_expires_at.is_some() {
                return Err(CrawlError::CorruptCheckpoint(format!(
                    "job {} has lease fields inconsistent with status {}",
                    job.id, job.status
                )));
            }
            if job.status == JobStatus::Done && !entity_keys.contains(job.entity_key.as_str()) {
                return Err(CrawlError::CorruptCheckpoint(format!(
                    "done job {} has no aggregated entity for {}",
                    job.id, job.entity_key
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::ResultAggregator;
    use crate::job::{CatalogEntry, ResultRecord};
    use serde_json::Map;

    fn done_job(key: &str) -> Job {
        let mut job = Job::from_entry(CatalogEntry::new(key), 3);
        job.status = JobStatus::Done;
        job.attempt_count = 1;
        job
    }

    fn entity(key: &str) -> AggregatedEntity {
        let mut fields = Map::new();
        fields.insert("name".to_string(), serde_json::json!("x"));
        let mut agg = ResultAggregator::new();
        agg.merge(
            key,
            ResultRecord {
                entity_key: key.to_string(),
                fields,
                submitted_at: 1,
                source_job_id: key.to_string(),
            },
        )
        .clone()
    }

    #[test]
    fn test_consistent_checkpoint_validates() {
        let checkpoint = Checkpoint::new(1, vec![done_job("a")], vec![entity("a")]);
        assert!(checkpoint.validate().is_ok());
    }

    #[test]
    fn test_done_job_without_entity_is_corrupt() {
        let checkpoint = Checkpoint::new(1, vec![done_job("a")], vec![]);
        let err = checkpoint.validate().unwrap_err();
        assert!(matches!(err, CrawlError::CorruptCheckpoint(_)));
        assert!(err.to_string().contains("no aggregated entity"));
    }

    #[test]
    fn test_lease_fields_on_pending_job_are_corrupt() {
        let mut job = Job::from_entry(CatalogEntry::new("a"), 3);
        job.lease_owner = Some("w1".to_string());
        let checkpoint = Checkpoint::new(1, vec![job], vec![]);
        assert!(matches!(checkpoint.validate(), Err(CrawlError::CorruptCheckpoint(_))));
    }

    #[test]
    fn test_duplicate_jobs_are_corrupt() {
        let checkpoint = Checkpoint::new(1, vec![done_job("a"), done_job("a")], vec![entity("a")]);
        assert!(matches!(checkpoint.validate(), Err(CrawlError::CorruptCheckpoint(_))));
    }
}
