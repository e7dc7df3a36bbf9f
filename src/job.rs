use crate::CrawlError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Joins entity key and keyword in a job id.
pub const JOB_ID_SEPARATOR: &str = "::";

/// Milliseconds since the Unix epoch. All lease deadlines use this clock.
pub type Timestamp = u64;

pub fn now_millis() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as Timestamp)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Leased,
    Done,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Leased => "leased",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One line of the input catalog: an entity, optionally reached through a search keyword.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub entity_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyword: Option<String>,
    #[serde(default)]
    pub descriptor: Map<String, Value>,
}

impl CatalogEntry {
    pub fn new(entity_key: impl Into<String>) -> Self {
        Self {
            entity_key: entity_key.into(),
            keyword: None,
            descriptor: Map::new(),
        }
    }

    pub fn with_keyword(mut self, keyword: impl Into<String>) -> Self {
        self.keyword = Some(keyword.into());
        self
    }

    pub fn with_field(mut self, name: impl Into<String>, value: Value) -> Self {
        self.descriptor.insert(name.into(), value);
        self
    }

    /// Reject entries whose job id would be blank or ambiguous. The `::` separator may
    /// not appear inside either part, otherwise `("a::b", None)` and `("a", "b")` collide.
    pub fn validate(&self) -> Result<(), CrawlError> {
        if self.entity_key.trim().is_empty() {
            return Err(CrawlError::InvalidCatalog("empty entity_key".to_string()));
        }
        if self.entity_key.contains(JOB_ID_SEPARATOR) {
            return Err(CrawlError::InvalidCatalog(format!(
                "entity_key {:?} contains {:?}",
                self.entity_key, JOB_ID_SEPARATOR
            )));
        }
        if let Some(keyword) = &self.keyword {
            if keyword.trim().is_empty() {
                return Err(CrawlError::InvalidCatalog(format!("empty keyword for {}", self.entity_key)));
            }
            if keyword.contains(JOB_ID_SEPARATOR) {
                return Err(CrawlError::InvalidCatalog(format!(
                    "keyword {:?} contains {:?}",
                    keyword, JOB_ID_SEPARATOR
                )));
            }
        }
        Ok(())
    }

    /// Stable job id: the entity key, suffixed with `::keyword` when a keyword produced it.
    pub fn job_id(&self) -> String {
        match &self.keyword {
            Some(keyword) => format!("{}{}{}", self.entity_key, JOB_ID_SEPARATOR, keyword),
            None => self.entity_key.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub entity_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyword: Option<String>,
    #[serde(default)]
    pub descriptor: Map<String, Value>,
    pub status: JobStatus,
    #[serde(default)]
    pub lease_owner: Option<String>,
    #[serde(default)]
    pub lease_expires_at: Option<Timestamp>,
    pub attempt_count: u32,
    pub max_attempts: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub completed_by: Option<String>,
}

impl Job {
    pub fn from_entry(entry: CatalogEntry, max_attempts: u32) -> Self {
        Self {
            id: entry.job_id(),
            entity_key: entry.entity_key,
            keyword: entry.keyword,
            descriptor: entry.descriptor,
            status: JobStatus::Pending,
            lease_owner: None,
            lease_expires_at: None,
            attempt_count: 0,
            max_attempts,
            last_error: None,
            completed_by: None,
        }
    }

    /// Whether this job was created from `entry` (content comparison used by idempotent loads).
    pub fn matches_entry(&self, entry: &CatalogEntry) -> bool {
        self.entity_key == entry.entity_key
            && self.keyword == entry.keyword
            && self.descriptor == entry.descriptor
    }

    pub fn lease_expired(&self, now: Timestamp) -> bool {
        self.status == JobStatus::Leased && self.lease_expires_at.map(|t| t <= now).unwrap_or(true)
    }

    pub fn holds_lease(&self, worker_id: &str, now: Timestamp) -> bool {
        self.status == JobStatus::Leased
            && self.lease_owner.as_deref() == Some(worker_id)
            && !self.lease_expired(now)
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.attempt_count >= self.max_attempts
    }

    pub fn descriptor(&self) -> JobDescriptor {
        JobDescriptor {
            job_id: self.id.clone(),
            entity_key: self.entity_key.clone(),
            keyword: self.keyword.clone(),
            descriptor: self.descriptor.clone(),
        }
    }

    pub(crate) fn clear_lease(&mut self) {
        self.lease_owner = None;
        self.lease_expires_at = None;
    }
}

/// What a worker hands to the executor: everything it needs and nothing about lease state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub job_id: String,
    pub entity_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyword: Option<String>,
    #[serde(default)]
    pub descriptor: Map<String, Value>,
}

/// A lease handed to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaseGrant {
    pub job: JobDescriptor,
    pub worker_id: String,
    pub attempt: u32,
    pub lease_expires_at: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub entity_key: String,
    pub fields: Map<String, Value>,
    pub submitted_at: Timestamp,
    pub source_job_id: String,
}
