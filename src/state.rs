use crate::aggregator::{AggregatedEntity, ResultAggregator};
use crate::checkpoint::Checkpoint;
use crate::job::{CatalogEntry, ResultRecord, Timestamp};
use crate::job_store::{DoneOutcome, FailOutcome, JobStore};
use crate::CrawlError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Stats {
    pub pending: usize,
    pub leased: usize,
    pub done: usize,
    pub failed: usize,
    pub total: usize,
    /// Fraction of the catalog that finished successfully
    pub completion_rate: f64,
    /// Jobs completed per minute since the coordinator started
    pub throughput_per_min: f64,
    pub entities: usize,
    /// Successful submissions accepted since the coordinator started
    pub results_accepted: u64,
}

/// Everything the coordinator mutates: the job table, the aggregation table and
/// bookkeeping for snapshots. Lives behind a single lock.
#[derive(Debug)]
pub struct CrawlState {
    pub jobs: JobStore,
    pub results: ResultAggregator,
    results_since_snapshot: usize,
    results_accepted: u64,
    started_at: Timestamp,
}

impl CrawlState {
    pub fn new(max_attempts: u32, started_at: Timestamp) -> Self {
        Self {
            jobs: JobStore::new(max_attempts),
            results: ResultAggregator::new(),
            results_since_snapshot: 0,
            results_accepted: 0,
            started_at,
        }
    }

    /// Rebuild state from a validated checkpoint. Leased jobs come back expired.
    pub fn from_checkpoint(checkpoint: Checkpoint, max_attempts: u32, started_at: Timestamp) -> Result<Self, CrawlError> {
        checkpoint.validate()?;
        let mut state = Self::new(max_attempts, started_at);
        state.jobs.restore(checkpoint.jobs)?;
        state.results.restore(checkpoint.aggregated_entities);
        Ok(state)
    }

    pub fn load_catalog(&mut self, catalog: Vec<CatalogEntry>) -> Result<usize, CrawlError> {
        self.jobs.load(catalog)
    }

    pub fn to_checkpoint(&self, saved_at: Timestamp) -> Checkpoint {
        Checkpoint::new(saved_at, self.jobs.snapshot(), self.results.snapshot())
    }

    /// Record a successful execution: close the lease, then fold the payload into
    /// the entity. Repeat reports for a done job do not merge again.
    pub fn complete(
        &mut self,
        job_id: &str,
        worker_id: &str,
        fields: Map<String, Value>,
        now: Timestamp,
    ) -> Result<DoneOutcome, CrawlError> {
        let outcome = self.jobs.mark_done_at(job_id, worker_id, now)?;
        if outcome == DoneOutcome::AlreadyDone {
            return Ok(outcome);
        }

        let entity_key = match self.jobs.get(job_id) {
            Some(job) => job.entity_key.clone(),
            None => return Err(CrawlError::UnknownJob(job_id.to_string())),
        };
        let record = ResultRecord {
            entity_key: entity_key.clone(),
            fields,
            submitted_at: now,
            source_job_id: job_id.to_string(),
        };
        self.results.merge(&entity_key, record);
        self.results_since_snapshot += 1;
        self.results_accepted += 1;
        Ok(outcome)
    }

    pub fn fail(&mut self, job_id: &str, worker_id: &str, reason: &str, now: Timestamp) -> Result<FailOutcome, CrawlError> {
        self.jobs.mark_failed_at(job_id, worker_id, reason, now)
    }

    pub fn is_dirty(&self) -> bool {
        self.jobs.is_dirty()
    }

    pub fn results_since_snapshot(&self) -> usize {
        self.results_since_snapshot
    }

    /// Called once a snapshot of the current state has been taken.
    pub fn mark_snapshotted(&mut self) {
        self.jobs.clear_dirty();
        self.results_since_snapshot = 0;
    }

    /// Undo `mark_snapshotted` after a failed write so the next tick retries.
    pub fn mark_snapshot_failed(&mut self, results: usize) {
        self.jobs.mark_dirty();
        self.results_since_snapshot += results;
    }

    pub fn export(&self) -> Vec<AggregatedEntity> {
        self.results.entities().cloned().collect()
    }

    pub fn stats(&self, now: Timestamp) -> Stats {
        let counts = self.jobs.counts();
        let total = counts.total();
        let completion_rate = if total == 0 { 1.0 } else { counts.done as f64 / total as f64 };
        let elapsed_ms = now.saturating_sub(self.started_at);
        let throughput_per_min = if elapsed_ms == 0 {
            0.0
        } else {
            self.results_accepted as f64 * 60_000.0 / elapsed_ms as f64
        };
        Stats {
            pending: counts.pending,
            leased: counts.leased,
            done: counts.done,
            failed: counts.failed,
            total,
            completion_rate,
            throughput_per_min,
            entities: self.results.len(),
            results_accepted: self.results_accepted,
        }
    }
}
