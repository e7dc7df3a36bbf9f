use crate::client::CoordinatorApi;
use crate::config::CrawlConfig;
use crate::executor::{Executor, ExecutorFailure};
use crate::job::{now_millis, LeaseGrant};
use crate::protocol::{HeartbeatResponse, LeaseResponse, SubmitRequest, SubmitResponse};
use crate::shutdown::Shutdown;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;

const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(200);
const SUBMIT_ATTEMPTS: u32 = 3;

/// Exponential delay between `min` and `max`, doubling per call until reset.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self { min, max: max.max(min), current: min }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.min;
    }
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub executor_timeout: Duration,
    pub poll_backoff_min: Duration,
    pub poll_backoff_max: Duration,
}

impl From<&CrawlConfig> for WorkerSettings {
    fn from(config: &CrawlConfig) -> Self {
        Self {
            executor_timeout: config.executor_timeout,
            poll_backoff_min: config.poll_backoff_min,
            poll_backoff_max: config.poll_backoff_max,
        }
    }
}

/// What one worker slot did before it stopped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerSummary {
    pub worker_id: String,
    /// Successful results the coordinator accepted
    pub completed: usize,
    /// Failures the coordinator accepted
    pub failed: usize,
    /// Submissions refused or abandoned because the lease was lost
    pub rejected: usize,
    pub transport_errors: usize,
}

/// One execution slot: lease, execute, report, repeat.
///
/// Holds no persistent state. A worker that dies simply stops heartbeating and its
/// lease expires on the coordinator.
pub struct Worker<C, E> {
    id: String,
    client: Arc<C>,
    executor: Arc<E>,
    settings: WorkerSettings,
}

impl<C, E> Worker<C, E>
where
    C: CoordinatorApi,
    E: Executor,
{
    pub fn new(id: impl Into<String>, client: Arc<C>, executor: Arc<E>, settings: WorkerSettings) -> Self {
        Self {
            id: id.into(),
            client,
            executor,
            settings,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Run until the coordinator reports the crawl complete or `shutdown` fires.
    /// Shutdown is only observed between jobs.
    pub async fn run(&self, shutdown: Arc<Shutdown>) -> WorkerSummary {
        let mut summary = WorkerSummary {
            worker_id: self.id.clone(),
            ..WorkerSummary::default()
        };
        let mut backoff = Backoff::new(self.settings.poll_backoff_min, self.settings.poll_backoff_max);

        loop {
            if shutdown.is_triggered() {
                break;
            }
            let response = tokio::select! {
                _ = shutdown.wait() => break,
                response = self.client.request_lease(&self.id) => response,
            };

            let delay = match response {
                Ok(LeaseResponse::Granted { job }) => {
                    backoff.reset();
                    self.process(job, &mut summary).await;
                    continue;
                }
                Ok(LeaseResponse::Complete) => {
                    tracing::info!(worker_id = %self.id, "crawl complete, worker exiting");
                    break;
                }
                Ok(LeaseResponse::NoWork) => backoff.next_delay(),
                Err(e) => {
                    summary.transport_errors += 1;
                    let delay = backoff.next_delay();
                    tracing::warn!(worker_id = %self.id, error = %e, ?delay, "lease request failed");
                    delay
                }
            };

            tokio::select! {
                _ = shutdown.wait() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        tracing::info!(
            worker_id = %self.id,
            completed = summary.completed,
            failed = summary.failed,
            rejected = summary.rejected,
            "worker stopped"
        );
        summary
    }

    async fn process(&self, grant: LeaseGrant, summary: &mut WorkerSummary) {
        let job_id = grant.job.job_id.clone();
        tracing::info!(worker_id = %self.id, job_id = %job_id, attempt = grant.attempt, "executing job");

        let outcome = self.execute_with_heartbeat(&grant).await;
        let succeeded = outcome.is_ok();
        let request = match outcome {
            Ok(fields) => SubmitRequest::success(&job_id, &self.id, fields),
            Err(ExecutorFailure::LeaseLost(reason)) => {
                tracing::warn!(worker_id = %self.id, job_id = %job_id, %reason, "lease lost, dropping result");
                summary.rejected += 1;
                return;
            }
            Err(failure) => {
                tracing::warn!(worker_id = %self.id, job_id = %job_id, error = %failure, "job execution failed");
                SubmitRequest::failure(&job_id, &self.id, failure.to_string())
            }
        };

        match self.submit(request, summary).await {
            Some(SubmitResponse::Accepted) if succeeded => summary.completed += 1,
            Some(SubmitResponse::Accepted) => summary.failed += 1,
            Some(SubmitResponse::Rejected { reason }) => {
                tracing::warn!(worker_id = %self.id, job_id = %job_id, %reason, "submission rejected");
                summary.rejected += 1;
            }
            None => {}
        }
    }

    /// Submit with a short retry on transport errors. Gives up after a few attempts
    /// and leaves the job to lease expiry.
    async fn submit(&self, request: SubmitRequest, summary: &mut WorkerSummary) -> Option<SubmitResponse> {
        let mut backoff = Backoff::new(self.settings.poll_backoff_min, self.settings.poll_backoff_max);
        for attempt in 1..=SUBMIT_ATTEMPTS {
            match self.client.submit_result(request.clone()).await {
                Ok(response) => return Some(response),
                Err(e) => {
                    summary.transport_errors += 1;
                    tracing::warn!(worker_id = %self.id, job_id = %request.job_id, attempt, error = %e, "submit failed");
                    if attempt < SUBMIT_ATTEMPTS {
                        tokio::time::sleep(backoff.next_delay()).await;
                    }
                }
            }
        }
        None
    }

    /// Run the executor under its timeout while heartbeating the lease. A refused
    /// heartbeat aborts execution.
    async fn execute_with_heartbeat(&self, grant: &LeaseGrant) -> Result<Map<String, Value>, ExecutorFailure> {
        let interval = heartbeat_interval(grant.lease_expires_at, now_millis());
        let timeout = self.settings.executor_timeout;
        let execution = tokio::time::timeout(timeout, self.executor.execute(&grant.job));
        tokio::pin!(execution);

        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        loop {
            tokio::select! {
                result = &mut execution => {
                    return result.unwrap_or(Err(ExecutorFailure::Timeout(timeout)));
                }
                _ = ticker.tick() => {
                    match self.client.heartbeat(&grant.job.job_id, &self.id).await {
                        Ok(HeartbeatResponse::Extended { lease_expires_at }) => {
                            tracing::debug!(worker_id = %self.id, job_id = %grant.job.job_id, lease_expires_at, "lease extended");
                        }
                        Ok(HeartbeatResponse::Rejected { reason }) => return Err(ExecutorFailure::LeaseLost(reason)),
                        // The lease may still be alive; keep working and try again next tick
                        Err(e) => {
                            tracing::warn!(worker_id = %self.id, job_id = %grant.job.job_id, error = %e, "heartbeat failed");
                        }
                    }
                }
            }
        }
    }
}

/// A third of the lease time remaining, never shorter than `MIN_HEARTBEAT_INTERVAL`.
fn heartbeat_interval(lease_expires_at: u64, now: u64) -> Duration {
    let remaining = Duration::from_millis(lease_expires_at.saturating_sub(now));
    (remaining / 3).max(MIN_HEARTBEAT_INTERVAL)
}

/// Run `slots` workers concurrently against one coordinator and collect their
/// summaries once all of them stopped.
pub async fn run_pool<C, E>(
    client: Arc<C>,
    executor: Arc<E>,
    settings: WorkerSettings,
    slots: usize,
    id_prefix: &str,
    shutdown: Arc<Shutdown>,
) -> Vec<WorkerSummary>
where
    C: CoordinatorApi + 'static,
    E: Executor + 'static,
{
    let mut handles = Vec::with_capacity(slots);
    for slot in 0..slots.max(1) {
        let worker = Worker::new(
            format!("{}-{}", id_prefix, slot),
            client.clone(),
            executor.clone(),
            settings.clone(),
        );
        let shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move { worker.run(shutdown).await }));
    }

    let mut summaries = Vec::with_capacity(handles.len());
    for handle in handles {
        match handle.await {
            Ok(summary) => summaries.push(summary),
            Err(e) => tracing::error!(error = %e, "worker task panicked"),
        }
    }
    summaries
}
