use std::fmt;

#[derive(Debug)]
pub enum CrawlError {
    DuplicateJob(String),
    InvalidCatalog(String),
    UnknownJob(String),
    LeaseMismatch { job_id: String, worker_id: String, reason: String },
    CorruptCheckpoint(String),
    Serialization(serde_json::Error),
    Io(std::io::Error),
    Transport(String),
    Config(String),
    Other(String),
}

impl CrawlError {
    /// Rejections are expected under lease races and never fatal to the coordinator.
    pub fn is_rejection(&self) -> bool {
        matches!(self, CrawlError::LeaseMismatch { .. } | CrawlError::UnknownJob(_))
    }
}

impl fmt::Display for CrawlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CrawlError::DuplicateJob(id) => write!(f, "Duplicate job with conflicting content: {}", id),
            CrawlError::InvalidCatalog(e) => write!(f, "Invalid catalog entry: {}", e),
            CrawlError::UnknownJob(id) => write!(f, "Unknown job: {}", id),
            CrawlError::LeaseMismatch { job_id, worker_id, reason } => {
                write!(f, "Lease mismatch for job {} (worker {}): {}", job_id, worker_id, reason)
            }
            CrawlError::CorruptCheckpoint(e) => write!(f, "Corrupt checkpoint: {}", e),
            CrawlError::Serialization(e) => write!(f, "Serialization error: {}", e),
            CrawlError::Io(e) => write!(f, "IO error: {}", e),
            CrawlError::Transport(e) => write!(f, "Transport error: {}", e),
            CrawlError::Config(e) => write!(f, "Config error: {}", e),
            CrawlError::Other(e) => write!(f, "Error: {}", e),
        }
    }
}

impl std::error::Error for CrawlError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CrawlError::Serialization(e) => Some(e),
            CrawlError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for CrawlError {
    fn from(err: serde_json::Error) -> Self {
        CrawlError::Serialization(err)
    }
}

impl From<std::io::Error> for CrawlError {
    fn from(err: std::io::Error) -> Self {
        CrawlError::Io(err)
    }
}

#[cfg(feature = "distributed")]
impl From<reqwest::Error> for CrawlError {
    fn from(err: reqwest::Error) -> Self {
        CrawlError::Transport(err.to_string())
    }
}

impl From<String> for CrawlError {
    fn from(err: String) -> Self {
        CrawlError::Other(err)
    }
}

impl From<&str> for CrawlError {
    fn from(err: &str) -> Self {
        CrawlError::Other(err.to_string())
    }
}
