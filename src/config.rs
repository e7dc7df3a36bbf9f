use crate::CrawlError;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Operational tuning for the coordinator and its workers.
#[derive(Debug, Clone)]
pub struct CrawlConfig {
    pub state_dir: PathBuf,
    pub lease_ttl: Duration,
    pub max_attempts: u32,
    pub checkpoint_interval: Duration,
    /// Snapshot early once this many results were accepted since the last write
    pub checkpoint_every_results: usize,
    pub sweep_interval: Duration,
    pub poll_backoff_min: Duration,
    pub poll_backoff_max: Duration,
    pub executor_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("./crawl_state"),
            lease_ttl: Duration::from_secs(300),
            max_attempts: 3,
            checkpoint_interval: Duration::from_secs(30),
            checkpoint_every_results: 50,
            sweep_interval: Duration::from_secs(10),
            poll_backoff_min: Duration::from_millis(500),
            poll_backoff_max: Duration::from_secs(30),
            executor_timeout: Duration::from_secs(120),
            request_timeout: Duration::from_secs(5),
        }
    }
}

impl CrawlConfig {
    /// Defaults overridden by `CRAWL_*` environment variables.
    pub fn from_env() -> Result<Self, CrawlError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, CrawlError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(dir) = lookup("CRAWL_STATE_DIR").filter(|d| !d.is_empty()) {
            config.state_dir = PathBuf::from(dir);
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, "CRAWL_LEASE_TTL_SECS")? {
            config.lease_ttl = Duration::from_secs(secs);
        }
        if let Some(n) = parse_var(&lookup, "CRAWL_MAX_ATTEMPTS")? {
            config.max_attempts = n;
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, "CRAWL_CHECKPOINT_INTERVAL_SECS")? {
            config.checkpoint_interval = Duration::from_secs(secs);
        }
        if let Some(n) = parse_var(&lookup, "CRAWL_CHECKPOINT_EVERY_RESULTS")? {
            config.checkpoint_every_results = n;
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, "CRAWL_SWEEP_INTERVAL_SECS")? {
            config.sweep_interval = Duration::from_secs(secs);
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "CRAWL_POLL_BACKOFF_MIN_MS")? {
            config.poll_backoff_min = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "CRAWL_POLL_BACKOFF_MAX_MS")? {
            config.poll_backoff_max = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, "CRAWL_EXECUTOR_TIMEOUT_SECS")? {
            config.executor_timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "CRAWL_REQUEST_TIMEOUT_MS")? {
            config.request_timeout = Duration::from_millis(ms);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), CrawlError> {
        if self.max_attempts == 0 {
            return Err(CrawlError::Config("max_attempts must be at least 1".to_string()));
        }
        if self.lease_ttl.is_zero() {
            return Err(CrawlError::Config("lease_ttl must be positive".to_string()));
        }
        if self.sweep_interval.is_zero() || self.checkpoint_interval.is_zero() {
            return Err(CrawlError::Config("sweep and checkpoint intervals must be positive".to_string()));
        }
        if self.poll_backoff_min > self.poll_backoff_max {
            return Err(CrawlError::Config(format!(
                "poll backoff min {:?} exceeds max {:?}",
                self.poll_backoff_min, self.poll_backoff_max
            )));
        }
        if self.checkpoint_every_results == 0 {
            return Err(CrawlError::Config("checkpoint_every_results must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.state_dir.join("checkpoint.json")
    }
}

fn parse_var<T, F>(lookup: &F, name: &str) -> Result<Option<T>, CrawlError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| CrawlError::Config(format!("{}={:?}: {}", name, raw, e))),
        _ => Ok(None),
    }
}
