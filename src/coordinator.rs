use crate::aggregator::AggregatedEntity;
use crate::checkpoint_manager::CheckpointManager;
use crate::config::CrawlConfig;
use crate::job::{now_millis, CatalogEntry};
use crate::job_store::{DoneOutcome, FailOutcome, LeaseOutcome};
use crate::protocol::{HeartbeatResponse, JobOutcome, LeaseResponse, SubmitRequest, SubmitResponse};
use crate::shutdown::Shutdown;
use crate::state::{CrawlState, Stats};
use crate::CrawlError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, Notify};

struct Inner {
    state: Mutex<CrawlState>,
    checkpoints: Arc<std::sync::Mutex<CheckpointManager>>,
    /// Serializes snapshot writers so an older snapshot never lands after a newer one
    snapshot_gate: Mutex<()>,
    snapshot_hint: Notify,
    /// Set under the state lock by `shutdown`; no mutation is accepted afterwards
    closed: AtomicBool,
    stats_tx: watch::Sender<Stats>,
    config: CrawlConfig,
}

/// The single coordination service. Cheap to clone; every clone shares state.
///
/// All job and result mutations go through one lock, so concurrent requests observe
/// a linear sequence of transitions. Stats are published on a watch channel after
/// each mutation and read without that lock.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    pub fn new(state: CrawlState, checkpoints: CheckpointManager, config: CrawlConfig) -> Self {
        let (stats_tx, _) = watch::channel(state.stats(now_millis()));
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(state),
                checkpoints: Arc::new(std::sync::Mutex::new(checkpoints)),
                snapshot_gate: Mutex::new(()),
                snapshot_hint: Notify::new(),
                closed: AtomicBool::new(false),
                stats_tx,
                config,
            }),
        }
    }

    /// Recover the last checkpoint if there is one, then load the catalog on top of it.
    /// A corrupt checkpoint stops startup.
    pub fn start(config: CrawlConfig, catalog: Vec<CatalogEntry>) -> Result<Self, CrawlError> {
        config.validate()?;
        let manager = CheckpointManager::new(
            config.checkpoint_path(),
            config.checkpoint_interval,
            config.checkpoint_every_results,
        );
        let now = now_millis();
        let mut state = match manager.recover()? {
            Some(checkpoint) => {
                tracing::info!(saved_at = checkpoint.saved_at, "resuming from checkpoint");
                CrawlState::from_checkpoint(checkpoint, config.max_attempts, now)?
            }
            None => CrawlState::new(config.max_attempts, now),
        };
        let added = state.load_catalog(catalog)?;
        let counts = state.jobs.counts();
        tracing::info!(
            added,
            pending = counts.pending,
            done = counts.done,
            failed = counts.failed,
            "catalog ready"
        );
        Ok(Self::new(state, manager, config))
    }

    pub fn config(&self) -> &CrawlConfig {
        &self.inner.config
    }

    pub async fn request_lease(&self, worker_id: &str) -> LeaseResponse {
        let mut state = self.inner.state.lock().await;
        if self.is_closed() {
            return if state.jobs.is_complete() { LeaseResponse::Complete } else { LeaseResponse::NoWork };
        }
        let response = match state.jobs.lease_next_at(worker_id, self.inner.config.lease_ttl, now_millis()) {
            LeaseOutcome::Granted(grant) => {
                tracing::info!(job_id = %grant.job.job_id, worker_id, attempt = grant.attempt, "lease granted");
                LeaseResponse::Granted { job: grant }
            }
            LeaseOutcome::NoWorkAvailable if state.jobs.is_complete() => LeaseResponse::Complete,
            LeaseOutcome::NoWorkAvailable => LeaseResponse::NoWork,
        };
        self.publish(&state);
        response
    }

    pub async fn submit_result(&self, request: SubmitRequest) -> SubmitResponse {
        let job_id = request.job_id.as_str();
        let worker_id = request.worker_id.as_str();
        let now = now_millis();

        let mut state = self.inner.state.lock().await;
        if self.is_closed() {
            tracing::warn!(job_id, worker_id, "submission after shutdown rejected");
            return SubmitResponse::Rejected { reason: SHUTTING_DOWN.to_string() };
        }
        let result = match request.outcome() {
            JobOutcome::Success(payload) => state.complete(job_id, worker_id, payload, now).map(|outcome| {
                match outcome {
                    DoneOutcome::Completed => tracing::info!(job_id, worker_id, "job done"),
                    DoneOutcome::AlreadyDone => tracing::debug!(job_id, worker_id, "duplicate result ignored"),
                }
            }),
            JobOutcome::Failure(reason) => state.fail(job_id, worker_id, &reason, now).map(|outcome| match outcome {
                FailOutcome::Requeued { attempts_left } => {
                    tracing::warn!(job_id, worker_id, attempts_left, error = %reason, "job failed, requeued")
                }
                FailOutcome::Failed => {
                    tracing::error!(job_id, worker_id, error = %reason, "job permanently failed")
                }
            }),
        };
        let snapshot_due = state.results_since_snapshot() >= self.inner.config.checkpoint_every_results;
        self.publish(&state);
        drop(state);

        if snapshot_due {
            self.inner.snapshot_hint.notify_one();
        }

        match result {
            Ok(()) => SubmitResponse::Accepted,
            Err(e) => {
                if e.is_rejection() {
                    tracing::warn!(job_id, worker_id, reason = %e, "submission rejected");
                } else {
                    tracing::error!(job_id, worker_id, error = %e, "submission failed");
                }
                SubmitResponse::Rejected { reason: e.to_string() }
            }
        }
    }

    /// Extend a live lease by another TTL.
    pub async fn heartbeat(&self, job_id: &str, worker_id: &str) -> HeartbeatResponse {
        let mut state = self.inner.state.lock().await;
        if self.is_closed() {
            return HeartbeatResponse::Rejected { reason: SHUTTING_DOWN.to_string() };
        }
        match state
            .jobs
            .extend_lease_at(job_id, worker_id, self.inner.config.lease_ttl, now_millis())
        {
            Ok(lease_expires_at) => {
                tracing::debug!(job_id, worker_id, lease_expires_at, "lease extended");
                HeartbeatResponse::Extended { lease_expires_at }
            }
            Err(e) => {
                tracing::warn!(job_id, worker_id, reason = %e, "heartbeat rejected");
                HeartbeatResponse::Rejected { reason: e.to_string() }
            }
        }
    }

    /// Last published statistics. Never waits on the state lock.
    pub fn get_stats(&self) -> Stats {
        self.inner.stats_tx.borrow().clone()
    }

    pub fn subscribe_stats(&self) -> watch::Receiver<Stats> {
        self.inner.stats_tx.subscribe()
    }

    /// Consistent copy of every aggregated entity.
    pub async fn export(&self) -> Vec<AggregatedEntity> {
        self.inner.state.lock().await.export()
    }

    pub async fn is_complete(&self) -> bool {
        self.inner.state.lock().await.jobs.is_complete()
    }

    pub async fn sweep_expired_leases(&self) -> usize {
        let mut state = self.inner.state.lock().await;
        let swept = state.jobs.sweep_expired_leases_at(now_millis());
        if swept > 0 {
            tracing::info!(swept, "expired leases released");
        }
        self.publish(&state);
        swept
    }

    /// Write a checkpoint if state is dirty and one is due.
    pub async fn maybe_snapshot(&self) -> Result<bool, CrawlError> {
        self.snapshot(false).await
    }

    /// Write a checkpoint unconditionally.
    pub async fn snapshot_now(&self) -> Result<(), CrawlError> {
        self.snapshot(true).await.map(|_| ())
    }

    async fn snapshot(&self, force: bool) -> Result<bool, CrawlError> {
        let _gate = self.inner.snapshot_gate.lock().await;

        let (checkpoint, pending_results) = {
            let mut state = self.inner.state.lock().await;
            if !force {
                let manager = lock_manager(&self.inner.checkpoints)?;
                if !manager.is_due(state.is_dirty(), state.results_since_snapshot()) {
                    return Ok(false);
                }
            }
            let checkpoint = state.to_checkpoint(now_millis());
            let pending_results = state.results_since_snapshot();
            state.mark_snapshotted();
            (checkpoint, pending_results)
        };

        let checkpoints = self.inner.checkpoints.clone();
        let written = tokio::task::spawn_blocking(move || {
            let mut manager = lock_manager(&checkpoints)?;
            manager.save(&checkpoint)
        })
        .await
            .map_err(|e| CrawlError::Other(format!("checkpoint task failed: {}", e)))
            .and_then(|result| result);

        if let Err(e) = written {
            self.inner.state.lock().await.mark_snapshot_failed(pending_results);
            return Err(e);
        }
        Ok(true)
    }

    /// Background upkeep: sweep expired leases and snapshot on their intervals, or
    /// sooner when enough results pile up. A checkpoint write failure ends the loop
    /// with an error. On shutdown a final checkpoint is written.
    pub async fn run_maintenance(&self, shutdown: Arc<Shutdown>) -> Result<(), CrawlError> {
        let mut sweep = tokio::time::interval(self.inner.config.sweep_interval);
        let mut checkpoint_tick = tokio::time::interval(self.inner.config.checkpoint_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        checkpoint_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = sweep.tick() => {
                    self.sweep_expired_leases().await;
                }
                _ = checkpoint_tick.tick() => {
                    self.maybe_snapshot().await?;
                }
                _ = self.inner.snapshot_hint.notified() => {
                    self.maybe_snapshot().await?;
                }
            }
        }

        self.shutdown().await
    }

    /// Stop accepting leases, results and heartbeats, then write the final checkpoint.
    /// Every result accepted before this call is in that checkpoint.
    pub async fn shutdown(&self) -> Result<(), CrawlError> {
        {
            let _state = self.inner.state.lock().await;
            self.inner.closed.store(true, Ordering::SeqCst);
        }
        tracing::info!("writing final checkpoint");
        self.snapshot_now().await
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn publish(&self, state: &CrawlState) {
        self.inner.stats_tx.send_replace(state.stats(now_millis()));
    }
}

const SHUTTING_DOWN: &str = "coordinator is shutting down";

fn lock_manager(
    checkpoints: &std::sync::Mutex<CheckpointManager>,
) -> Result<std::sync::MutexGuard<'_, CheckpointManager>, CrawlError> {
    checkpoints
        .lock()
        .map_err(|_| CrawlError::Other("checkpoint manager lock poisoned".to_string()))
}
