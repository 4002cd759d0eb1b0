//! Background flush task for one recording session

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::recorder::Session;

/// Shortest accepted flush period
const MIN_FLUSH_INTERVAL: Duration = Duration::from_millis(10);

/// Periodically flushes a session until shutdown or the session ends
pub(crate) struct FlushTask {
    session: Arc<Session>,
    flush_interval: Duration,
    shutdown_rx: broadcast::Receiver<()>,
}

impl FlushTask {
    /// Spawn the flush task as a background task
    pub(crate) fn spawn(
        session: Arc<Session>,
        flush_interval: Duration,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let task = Self {
            session,
            flush_interval: flush_interval.max(MIN_FLUSH_INTERVAL),
            shutdown_rx,
        };

        tokio::spawn(async move {
            task.run().await;
        })
    }

    async fn run(mut self) {
        info!(
            session_id = %self.session.session_id(),
            interval_secs = self.flush_interval.as_secs(),
            "Flush task started"
        );

        // First flush one full period after start
        let mut interval =
            tokio::time::interval_at(Instant::now() + self.flush_interval, self.flush_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown_rx.recv() => {
                    debug!(session_id = %self.session.session_id(), "Flush task shutting down");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.session.flush().await {
                        error!(
                            session_id = %self.session.session_id(),
                            error = %e,
                            "Periodic flush failed"
                        );
                    }
                    if !self.session.is_active() {
                        debug!(session_id = %self.session.session_id(), "Session ended, flush task exiting");
                        break;
                    }
                }
            }
        }
    }
}
