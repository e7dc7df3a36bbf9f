use crate::checkpoint::Checkpoint;
use crate::CrawlError;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Manages checkpoint save/recover for the coordinator.
///
/// There is exactly one manager per state directory and it is the only writer of
/// the checkpoint file.
pub struct CheckpointManager {
    checkpoint_path: PathBuf,
    temp_path: PathBuf,
    interval: Duration,
    every_results: usize,
    last_write: Instant,
}

impl CheckpointManager {
    pub fn new(checkpoint_path: PathBuf, interval: Duration, every_results: usize) -> Self {
        let mut temp_name = checkpoint_path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "checkpoint.json".into());
        temp_name.push(".tmp");
        let temp_path = checkpoint_path.with_file_name(temp_name);
        Self {
            checkpoint_path,
            temp_path,
            interval,
            every_results: every_results.max(1),
            last_write: Instant::now(),
        }
    }

    /// Create a manager writing `checkpoint.json` under `base_dir`
    pub fn with_base_dir(base_dir: &Path, interval: Duration, every_results: usize) -> Self {
        Self::new(base_dir.join("checkpoint.json"), interval, every_results)
    }

    pub fn path(&self) -> &Path {
        &self.checkpoint_path
    }

    /// Whether a snapshot is worth writing: state changed since the last write and
    /// either enough results piled up or the interval elapsed.
    pub fn is_due(&self, dirty: bool, results_since: usize) -> bool {
        self.is_due_at(dirty, results_since, Instant::now())
    }

    pub fn is_due_at(&self, dirty: bool, results_since: usize, now: Instant) -> bool {
        dirty && (results_since >= self.every_results || now.duration_since(self.last_write) >= self.interval)
    }

    /// Save a checkpoint atomically: write a temp file, flush it to disk, then
    /// rename it over the previous checkpoint.
    pub fn save(&mut self, checkpoint: &Checkpoint) -> Result<(), CrawlError> {
        if let Some(parent) = self.checkpoint_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        // Leftover from a save that died mid-write
        if self.temp_path.exists() {
            fs::remove_file(&self.temp_path)?;
        }

        {
            let file = File::create(&self.temp_path)?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer_pretty(&mut writer, checkpoint)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }

        fs::rename(&self.temp_path, &self.checkpoint_path)?;
        self.last_write = Instant::now();

        tracing::info!(
            path = %self.checkpoint_path.display(),
            jobs = checkpoint.jobs.len(),
            entities = checkpoint.aggregated_entities.len(),
            "checkpoint saved atomically"
        );
        Ok(())
    }

    /// Load the checkpoint if one exists.
    ///
    /// A missing file means a fresh start. A file that exists but cannot be read,
    /// parsed or validated is a fatal error: starting over it could drop completed work.
    pub fn recover(&self) -> Result<Option<Checkpoint>, CrawlError> {
        if !self.checkpoint_path.exists() {
            tracing::info!(path = %self.checkpoint_path.display(), "no checkpoint found, starting fresh");
            return Ok(None);
        }

        tracing::info!(path = %self.checkpoint_path.display(), "loading checkpoint");
        let bytes = fs::read(&self.checkpoint_path).map_err(|e| {
            CrawlError::CorruptCheckpoint(format!("{}: unreadable: {}", self.checkpoint_path.display(), e))
        })?;
        let checkpoint: Checkpoint = serde_json::from_slice(&bytes).map_err(|e| {
            CrawlError::CorruptCheckpoint(format!("{}: malformed: {}", self.checkpoint_path.display(), e))
        })?;
        checkpoint.validate()?;

        tracing::info!(
            saved_at = checkpoint.saved_at,
            jobs = checkpoint.jobs.len(),
            entities = checkpoint.aggregated_entities.len(),
            "checkpoint loaded"
        );
        Ok(Some(checkpoint))
    }
}
