//! Configuration for recording, recovery, and extraction

use std::path::PathBuf;
use std::time::Duration;

/// Default period between timer-driven flushes
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(30);

/// Default cap on one session's wall-clock duration before rollover
pub const DEFAULT_MAX_SESSION_DURATION: Duration = Duration::from_secs(3 * 60 * 60);

/// Configuration for a [`Recorder`](crate::Recorder)
#[derive(Debug, Clone)]
pub struct RecorderConfig {
    /// Period of the background flush task
    pub flush_interval: Duration,
    /// Session age past which the session rolls over to the next generation
    pub max_session_duration: Duration,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            max_session_duration: DEFAULT_MAX_SESSION_DURATION,
        }
    }
}

impl RecorderConfig {
    /// Set the flush period
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Set the rollover threshold
    pub fn with_max_session_duration(mut self, duration: Duration) -> Self {
        self.max_session_duration = duration;
        self
    }
}

/// Configuration for the [`RecoveryManager`](crate::RecoveryManager)
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// Drop location scanned for externally produced containers
    pub inbound_dir: PathBuf,
    /// Where ingested files are moved once registered
    pub processed_dir: PathBuf,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self::with_data_dir("./data")
    }
}

impl RecoveryConfig {
    /// Inbound and processed directories under a data directory
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            inbound_dir: data_dir.join("ingest"),
            processed_dir: data_dir.join("ingest-finished"),
        }
    }

    pub fn with_inbound_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.inbound_dir = dir.into();
        self
    }

    pub fn with_processed_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.processed_dir = dir.into();
        self
    }
}

/// Configuration for the [`ExtractionPool`](crate::ExtractionPool)
#[derive(Debug, Clone)]
pub struct ExtractionConfig {
    /// Maximum containers decoded at once
    pub max_workers: usize,
    /// Capacity of the worker message channel
    pub message_capacity: usize,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            max_workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            message_capacity: 256,
        }
    }
}

impl ExtractionConfig {
    pub fn with_max_workers(mut self, workers: usize) -> Self {
        self.max_workers = workers.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recorder_defaults() {
        let config = RecorderConfig::default();
        assert_eq!(config.flush_interval, Duration::from_secs(30));
        assert_eq!(config.max_session_duration, Duration::from_secs(10_800));
    }

    #[test]
    fn test_recovery_dirs_follow_data_dir() {
        let config = RecoveryConfig::with_data_dir("/srv/skyreel");
        assert_eq!(config.inbound_dir, PathBuf::from("/srv/skyreel/ingest"));
        assert_eq!(
            config.processed_dir,
            PathBuf::from("/srv/skyreel/ingest-finished")
        );
    }

    #[test]
    fn test_extraction_workers_at_least_one() {
        assert_eq!(ExtractionConfig::default().with_max_workers(0).max_workers, 1);
    }
}
