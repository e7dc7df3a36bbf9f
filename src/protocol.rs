//! Request and response bodies of the coordinator's HTTP contract.

use crate::job::{LeaseGrant, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaseRequest {
    pub worker_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LeaseResponse {
    Granted { job: LeaseGrant },
    NoWork,
    /// Every job is done or failed; workers should exit.
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitStatus {
    Ok,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub job_id: String,
    pub worker_id: String,
    pub status: SubmitStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// What the worker observed for a job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Success(Map<String, Value>),
    Failure(String),
}

impl SubmitRequest {
    pub fn success(job_id: impl Into<String>, worker_id: impl Into<String>, payload: Map<String, Value>) -> Self {
        Self {
            job_id: job_id.into(),
            worker_id: worker_id.into(),
            status: SubmitStatus::Ok,
            payload: Some(payload),
            error: None,
        }
    }

    pub fn failure(job_id: impl Into<String>, worker_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            worker_id: worker_id.into(),
            status: SubmitStatus::Error,
            payload: None,
            error: Some(error.into()),
        }
    }

    pub fn outcome(&self) -> JobOutcome {
        match self.status {
            SubmitStatus::Ok => JobOutcome::Success(self.payload.clone().unwrap_or_default()),
            SubmitStatus::Error => JobOutcome::Failure(
                self.error
                    .clone()
                    .filter(|e| !e.trim().is_empty())
                    .unwrap_or_else(|| "unspecified error".to_string()),
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SubmitResponse {
    Accepted,
    /// The worker's lease is stale or the job is unknown. Not retried as-is.
    Rejected { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub job_id: String,
    pub worker_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum HeartbeatResponse {
    Extended { lease_expires_at: Timestamp },
    Rejected { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}

impl HealthResponse {
    pub fn ok() -> Self {
        Self { status: "ok".to_string() }
    }
}
