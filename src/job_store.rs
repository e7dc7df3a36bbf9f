use crate::job::{now_millis, CatalogEntry, Job, JobStatus, LeaseGrant, Timestamp};
use crate::CrawlError;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const LEASE_EXPIRED_REASON: &str = "lease expired";

#[derive(Debug, Clone, PartialEq)]
pub enum LeaseOutcome {
    Granted(LeaseGrant),
    NoWorkAvailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoneOutcome {
    Completed,
    /// The job was already done; repeat reports are accepted without effect.
    AlreadyDone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    Requeued { attempts_left: u32 },
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub leased: usize,
    pub done: usize,
    pub failed: usize,
}

impl StatusCounts {
    pub fn total(&self) -> usize {
        self.pending + self.leased + self.done + self.failed
    }
}

/// Authoritative registry of every job in the catalog.
///
/// Jobs keep their load order; lease selection scans that order, so behavior is
/// reproducible for a given sequence of calls. The store does no locking of its
/// own: callers serialize access.
#[derive(Debug, Default)]
pub struct JobStore {
    jobs: Vec<Job>,
    index: FxHashMap<String, usize>,
    max_attempts: u32,
    dirty: bool,
}

impl JobStore {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            jobs: Vec::new(),
            index: FxHashMap::default(),
            max_attempts: max_attempts.max(1),
            dirty: false,
        }
    }

    /// Load catalog entries. Entries already present with identical content are skipped,
    /// so loading the same catalog twice is a no-op. Nothing is inserted if any entry
    /// conflicts or is invalid. Returns the number of jobs added.
    pub fn load<I>(&mut self, catalog: I) -> Result<usize, CrawlError>
    where
        I: IntoIterator<Item = CatalogEntry>,
    {
        let mut batch: Vec<CatalogEntry> = Vec::new();
        let mut batch_index: FxHashMap<String, usize> = FxHashMap::default();

        for entry in catalog {
            entry.validate()?;
            let id = entry.job_id();
            if let Some(&idx) = self.index.get(&id) {
                if !self.jobs[idx].matches_entry(&entry) {
                    return Err(CrawlError::DuplicateJob(id));
                }
                continue;
            }
            if let Some(&pos) = batch_index.get(&id) {
                if batch[pos] != entry {
                    return Err(CrawlError::DuplicateJob(id));
                }
                continue;
            }
            batch_index.insert(id, batch.len());
            batch.push(entry);
        }

        let added = batch.len();
        for entry in batch {
            let job = Job::from_entry(entry, self.max_attempts);
            self.index.insert(job.id.clone(), self.jobs.len());
            self.jobs.push(job);
        }
        if added > 0 {
            self.dirty = true;
        }
        Ok(added)
    }

    pub fn lease_next(&mut self, worker_id: &str, ttl: Duration) -> LeaseOutcome {
        self.lease_next_at(worker_id, ttl, now_millis())
    }

    /// Lease one eligible job to `worker_id`.
    ///
    /// Previously attempted jobs (expired leases, swept or requeued jobs) are offered
    /// before jobs that were never attempted; load order breaks ties in both classes.
    pub fn lease_next_at(&mut self, worker_id: &str, ttl: Duration, now: Timestamp) -> LeaseOutcome {
        self.fail_exhausted_leases(now);

        let mut first_fresh: Option<usize> = None;
        let mut chosen: Option<usize> = None;
        for (idx, job) in self.jobs.iter().enumerate() {
            let retry = match job.status {
                JobStatus::Leased if job.lease_expired(now) => true,
                JobStatus::Pending if job.attempt_count > 0 => true,
                JobStatus::Pending => false,
                _ => continue,
            };
            if retry {
                chosen = Some(idx);
                break;
            }
            if first_fresh.is_none() {
                first_fresh = Some(idx);
            }
        }

        let Some(idx) = chosen.or(first_fresh) else {
            return LeaseOutcome::NoWorkAvailable;
        };

        let expires_at = now.saturating_add(ttl.as_millis() as Timestamp);
        let job = &mut self.jobs[idx];
        if let Some(previous) = job.lease_owner.as_deref() {
            tracing::debug!(job_id = %job.id, previous_owner = previous, "reclaiming expired lease");
        }
        job.status = JobStatus::Leased;
        job.lease_owner = Some(worker_id.to_string());
        job.lease_expires_at = Some(expires_at);
        job.attempt_count += 1;

        LeaseOutcome::Granted(LeaseGrant {
            job: job.descriptor(),
            worker_id: worker_id.to_string(),
            attempt: job.attempt_count,
            lease_expires_at: expires_at,
        })
    }

    pub fn mark_done(&mut self, job_id: &str, worker_id: &str) -> Result<DoneOutcome, CrawlError> {
        self.mark_done_at(job_id, worker_id, now_millis())
    }

    pub fn mark_done_at(&mut self, job_id: &str, worker_id: &str, now: Timestamp) -> Result<DoneOutcome, CrawlError> {
        let job = self.get_mut(job_id)?;
        match job.status {
            JobStatus::Done => Ok(DoneOutcome::AlreadyDone),
            JobStatus::Leased if job.holds_lease(worker_id, now) => {
                job.status = JobStatus::Done;
                job.completed_by = Some(worker_id.to_string());
                job.last_error = None;
                job.clear_lease();
                self.dirty = true;
                Ok(DoneOutcome::Completed)
            }
            _ => Err(lease_mismatch(job, worker_id, now)),
        }
    }

    pub fn mark_failed(&mut self, job_id: &str, worker_id: &str, reason: &str) -> Result<FailOutcome, CrawlError> {
        self.mark_failed_at(job_id, worker_id, reason, now_millis())
    }

    pub fn mark_failed_at(
        &mut self,
        job_id: &str,
        worker_id: &str,
        reason: &str,
        now: Timestamp,
    ) -> Result<FailOutcome, CrawlError> {
        let job = self.get_mut(job_id)?;
        if !job.holds_lease(worker_id, now) {
            return Err(lease_mismatch(job, worker_id, now));
        }

        job.last_error = Some(reason.to_string());
        job.clear_lease();
        if job.attempts_exhausted() {
            job.status = JobStatus::Failed;
            self.dirty = true;
            Ok(FailOutcome::Failed)
        } else {
            job.status = JobStatus::Pending;
            Ok(FailOutcome::Requeued {
                attempts_left: job.max_attempts - job.attempt_count,
            })
        }
    }

    pub fn extend_lease(&mut self, job_id: &str, worker_id: &str, ttl: Duration) -> Result<Timestamp, CrawlError> {
        self.extend_lease_at(job_id, worker_id, ttl, now_millis())
    }

    /// Push the lease deadline of a job the worker still holds to `now + ttl`.
    pub fn extend_lease_at(
        &mut self,
        job_id: &str,
        worker_id: &str,
        ttl: Duration,
        now: Timestamp,
    ) -> Result<Timestamp, CrawlError> {
        let job = self.get_mut(job_id)?;
        if !job.holds_lease(worker_id, now) {
            return Err(lease_mismatch(job, worker_id, now));
        }
        let expires_at = now.saturating_add(ttl.as_millis() as Timestamp);
        job.lease_expires_at = Some(expires_at);
        Ok(expires_at)
    }

    pub fn sweep_expired_leases(&mut self) -> usize {
        self.sweep_expired_leases_at(now_millis())
    }

    /// Release every expired lease. Jobs with attempts left return to `pending`,
    /// the rest become terminal `failed`.
    pub fn sweep_expired_leases_at(&mut self, now: Timestamp) -> usize {
        let mut swept = 0;
        for job in self.jobs.iter_mut() {
            if !job.lease_expired(now) {
                continue;
            }
            tracing::debug!(job_id = %job.id, owner = ?job.lease_owner, "sweeping expired lease");
            if release_expired(job) {
                self.dirty = true;
            }
            swept += 1;
        }
        swept
    }

    fn fail_exhausted_leases(&mut self, now: Timestamp) {
        for job in self.jobs.iter_mut() {
            if job.lease_expired(now) && job.attempts_exhausted() && release_expired(job) {
                self.dirty = true;
            }
        }
    }

    pub fn snapshot(&self) -> Vec<Job> {
        self.jobs.clone()
    }

    /// Replace the whole store with `jobs`. Jobs that were leased are treated as
    /// expired: their holders will be rejected on their next report.
    pub fn restore(&mut self, jobs: Vec<Job>) -> Result<(), CrawlError> {
        let mut index = FxHashMap::default();
        for (idx, job) in jobs.iter().enumerate() {
            if index.insert(job.id.clone(), idx).is_some() {
                return Err(CrawlError::DuplicateJob(job.id.clone()));
            }
        }

        self.jobs = jobs;
        self.index = index;
        let mut expired = 0;
        for job in self.jobs.iter_mut() {
            if job.status == JobStatus::Leased {
                release_expired(job);
                expired += 1;
            }
        }
        if expired > 0 {
            tracing::info!(expired, "restored leases treated as expired");
        }
        self.dirty = false;
        Ok(())
    }

    pub fn get(&self, job_id: &str) -> Option<&Job> {
        self.index.get(job_id).map(|&idx| &self.jobs[idx])
    }

    fn get_mut(&mut self, job_id: &str) -> Result<&mut Job, CrawlError> {
        match self.index.get(job_id) {
            Some(&idx) => Ok(&mut self.jobs[idx]),
            None => Err(CrawlError::UnknownJob(job_id.to_string())),
        }
    }

    pub fn jobs(&self) -> impl Iterator<Item = &Job> {
        self.jobs.iter()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for job in &self.jobs {
            match job.status {
                JobStatus::Pending => counts.pending += 1,
                JobStatus::Leased => counts.leased += 1,
                JobStatus::Done => counts.done += 1,
                JobStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }

    /// True when every job is `done` or `failed`.
    pub fn is_complete(&self) -> bool {
        self.jobs.iter().all(|job| job.status.is_terminal())
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }
}

/// Drop an expired lease. Returns true when the job became terminal.
fn release_expired(job: &mut Job) -> bool {
    job.clear_lease();
    if job.attempts_exhausted() {
        job.status = JobStatus::Failed;
        if job.last_error.is_none() {
            job.last_error = Some(LEASE_EXPIRED_REASON.to_string());
        }
        true
    } else {
        job.status = JobStatus::Pending;
        false
    }
}

fn lease_mismatch(job: &Job, worker_id: &str, now: Timestamp) -> CrawlError {
    let reason = match job.status {
        JobStatus::Pending => "job is not leased".to_string(),
        JobStatus::Done => "job already done".to_string(),
        JobStatus::Failed => "job permanently failed".to_string(),
        JobStatus::Leased => match job.lease_owner.as_deref() {
            Some(owner) if owner != worker_id => format!("job leased by {}", owner),
            _ if job.lease_expired(now) => LEASE_EXPIRED_REASON.to_string(),
            _ => "lease not held".to_string(),
        },
    };
    CrawlError::LeaseMismatch {
        job_id: job.id.clone(),
        worker_id: worker_id.to_string(),
        reason,
    }
}
