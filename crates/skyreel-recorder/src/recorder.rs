//! Per-session recorder
//!
//! A [`Recorder`] owns one recording session of one lobby. Incoming events
//! are buffered in memory and persisted to the ledger in compressed batches
//! by a periodic flush. Stopping the recorder persists the tail, appends the
//! `stop` marker and builds the container.
//!
//! Flushes and stops of one session are serialized through a single async
//! slot; the event buffer itself sits behind a short synchronous lock so
//! that recording never waits on compression or ledger I/O.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use skyreel_core::{
    Clock, Codec, Event, Ledger, LogRecord, ResyncSnapshot, StorageError, SystemClock,
};

use crate::builder::{BuildOutcome, ContainerBuilder};
use crate::config::RecorderConfig;
use crate::error::{RecorderError, RecorderResult};
use crate::flush_task::FlushTask;

/// Provides the lobby/mission state captured when a session starts
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn resync(&self, lobby_id: &str) -> RecorderResult<ResyncSnapshot>;
}

/// Snapshot source that always returns the same snapshot
#[derive(Debug, Clone, Default)]
pub struct StaticSnapshotSource {
    snapshot: ResyncSnapshot,
}

impl StaticSnapshotSource {
    pub fn new(snapshot: ResyncSnapshot) -> Self {
        Self { snapshot }
    }
}

#[async_trait]
impl SnapshotSource for StaticSnapshotSource {
    async fn resync(&self, _lobby_id: &str) -> RecorderResult<ResyncSnapshot> {
        Ok(self.snapshot.clone())
    }
}

/// Lifecycle state of a recording session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    /// Stop marker pending
    Stopping,
    Stopped,
}

/// Point-in-time view of a recording session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingSession {
    pub session_id: String,
    pub lobby_id: String,
    pub generation: u64,
    pub state: SessionState,
    pub pending_events: usize,
}

/// Raised when a session exceeds its maximum duration
///
/// The receiver is expected to start the next generation for the lobby and
/// then stop this session; until then the session keeps recording.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RolloverRequest {
    pub lobby_id: String,
    /// Session that just ended
    pub session_id: String,
    /// Generation of the session that just ended
    pub generation: u64,
}

/// Shared collaborators for every recorder of a process
#[derive(Clone)]
pub struct RecorderContext {
    pub config: RecorderConfig,
    pub ledger: Arc<dyn Ledger>,
    pub codec: Arc<dyn Codec>,
    pub clock: Arc<dyn Clock>,
    pub snapshots: Arc<dyn SnapshotSource>,
    pub builder: Arc<ContainerBuilder>,
    /// Where rollover requests go; without one a rollover ends the session inline
    pub rollover_tx: Option<mpsc::UnboundedSender<RolloverRequest>>,
}

impl RecorderContext {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        codec: Arc<dyn Codec>,
        snapshots: Arc<dyn SnapshotSource>,
        builder: Arc<ContainerBuilder>,
    ) -> Self {
        Self {
            config: RecorderConfig::default(),
            ledger,
            codec,
            clock: Arc::new(SystemClock),
            snapshots,
            builder,
            rollover_tx: None,
        }
    }

    pub fn with_config(mut self, config: RecorderConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_rollover_channel(mut self, tx: mpsc::UnboundedSender<RolloverRequest>) -> Self {
        self.rollover_tx = Some(tx);
        self
    }
}

struct SessionBuffer {
    state: SessionState,
    pending: Vec<Event>,
    /// A rollover request was handed to the listener
    rollover_requested: bool,
}

/// State shared between a recorder and its flush task
pub(crate) struct Session {
    session_id: String,
    lobby_id: String,
    generation: u64,
    started_at: i64,
    ctx: RecorderContext,
    buffer: Mutex<SessionBuffer>,
    /// Serializes flush, rollover and stop
    slot: tokio::sync::Mutex<()>,
    /// Build started by a rollover
    rollover_build: Mutex<Option<JoinHandle<RecorderResult<BuildOutcome>>>>,
}

impl Session {
    pub(crate) fn session_id(&self) -> &str {
        &self.session_id
    }

    pub(crate) fn is_active(&self) -> bool {
        self.buffer.lock().state == SessionState::Active
    }

    fn record(&self, batch: Vec<Event>) {
        if batch.is_empty() {
            return;
        }
        let now = self.ctx.clock.now_millis();
        let mut buffer = self.buffer.lock();
        if buffer.state != SessionState::Active {
            warn!(
                session_id = %self.session_id,
                state = ?buffer.state,
                events = batch.len(),
                "Dropping events for inactive session"
            );
            return;
        }
        buffer
            .pending
            .extend(batch.into_iter().map(|event| event.with_timestamp(now)));
    }

    /// Timer or caller driven flush
    pub(crate) async fn flush(&self) -> RecorderResult<usize> {
        let _slot = self.slot.lock().await;

        let batch = {
            let mut buffer = self.buffer.lock();
            if buffer.state != SessionState::Active {
                debug!(session_id = %self.session_id, state = ?buffer.state, "Flush on inactive session ignored");
                return Ok(0);
            }
            std::mem::take(&mut buffer.pending)
        };
        let persisted = self.persist(batch).await?;

        if self.exceeds_max_duration() {
            self.roll_over().await?;
        }
        Ok(persisted)
    }

    fn exceeds_max_duration(&self) -> bool {
        let limit = i64::try_from(self.ctx.config.max_session_duration.as_millis())
            .unwrap_or(i64::MAX);
        self.ctx.clock.now_millis().saturating_sub(self.started_at) > limit
    }

    /// Compress and append one batch
    ///
    /// A batch over the ledger's record limit is split in halves until every
    /// part fits. A single event that still does not fit, or a batch the
    /// codec rejects, is dropped with an error log. Any other failure puts
    /// the unwritten events back ahead of newer ones and returns the error.
    async fn persist(&self, batch: Vec<Event>) -> RecorderResult<usize> {
        let mut parts = VecDeque::from([batch]);
        let mut persisted = 0;

        while let Some(mut part) = parts.pop_front() {
            if part.is_empty() {
                continue;
            }
            match self.append_packet(&part).await {
                Ok(compressed) => {
                    debug!(
                        session_id = %self.session_id,
                        events = part.len(),
                        compressed,
                        "Flushed batch"
                    );
                    persisted += part.len();
                }
                Err(RecorderError::Storage(StorageError::RecordTooLarge { size, limit }))
                    if part.len() > 1 =>
                {
                    debug!(
                        session_id = %self.session_id,
                        events = part.len(),
                        size,
                        limit,
                        "Splitting oversized batch"
                    );
                    let second = part.split_off(part.len() / 2);
                    parts.push_front(second);
                    parts.push_front(part);
                }
                Err(
                    e @ (RecorderError::Codec(_)
                    | RecorderError::Storage(StorageError::RecordTooLarge { .. })),
                ) => {
                    error!(
                        session_id = %self.session_id,
                        events = part.len(),
                        error = %e,
                        "Dropping events that cannot be persisted"
                    );
                }
                Err(e) => {
                    let mut buffer = self.buffer.lock();
                    let newer = std::mem::take(&mut buffer.pending);
                    buffer.pending = part;
                    buffer.pending.extend(parts.into_iter().flatten());
                    buffer.pending.extend(newer);
                    return Err(e);
                }
            }
        }
        Ok(persisted)
    }

    /// Returns the compressed size
    async fn append_packet(&self, events: &[Event]) -> RecorderResult<usize> {
        let bytes = self.ctx.codec.encode(events)?;
        let record = LogRecord::packet(
            &self.session_id,
            &self.lobby_id,
            &bytes,
            self.ctx.clock.now_millis(),
        );
        self.ctx.ledger.append(&record).await?;
        Ok(bytes.len())
    }

    /// Persist any tail and append the stop marker
    ///
    /// Returns false if the session was already stopped. Caller holds the slot.
    async fn terminate(&self) -> RecorderResult<bool> {
        let tail = {
            let mut buffer = self.buffer.lock();
            if buffer.state == SessionState::Stopped {
                return Ok(false);
            }
            buffer.state = SessionState::Stopping;
            std::mem::take(&mut buffer.pending)
        };
        self.persist(tail).await?;

        let stop = LogRecord::stop(
            &self.session_id,
            &self.lobby_id,
            self.ctx.clock.now_millis(),
        );
        self.ctx.ledger.append(&stop).await?;
        self.buffer.lock().state = SessionState::Stopped;
        Ok(true)
    }

    /// Hand the session over to the next generation
    ///
    /// With a listener the session stays active and the listener stops it
    /// once its successor is live. Without one the session ends here and its
    /// container is built in the background.
    async fn roll_over(&self) -> RecorderResult<()> {
        if let Some(tx) = &self.ctx.rollover_tx {
            {
                let mut buffer = self.buffer.lock();
                if buffer.rollover_requested {
                    return Ok(());
                }
                buffer.rollover_requested = true;
            }
            let request = RolloverRequest {
                lobby_id: self.lobby_id.clone(),
                session_id: self.session_id.clone(),
                generation: self.generation,
            };
            if tx.send(request).is_ok() {
                info!(
                    session_id = %self.session_id,
                    lobby_id = %self.lobby_id,
                    generation = self.generation,
                    "Session exceeded maximum duration, next generation requested"
                );
                return Ok(());
            }
            warn!(lobby_id = %self.lobby_id, "No listener for rollover request");
        }

        if !self.terminate().await? {
            return Ok(());
        }
        info!(
            session_id = %self.session_id,
            lobby_id = %self.lobby_id,
            generation = self.generation,
            "Session exceeded maximum duration, ended"
        );

        let builder = Arc::clone(&self.ctx.builder);
        let session_id = self.session_id.clone();
        let handle = tokio::spawn(async move {
            let outcome = builder.build(&session_id).await;
            if let Err(e) = &outcome {
                error!(session_id = %session_id, error = %e, "Rollover build failed");
            }
            outcome
        });
        *self.rollover_build.lock() = Some(handle);
        Ok(())
    }

    async fn stop(&self) -> RecorderResult<bool> {
        let _slot = self.slot.lock().await;
        self.terminate().await
    }
}

/// Records one session of one lobby
pub struct Recorder {
    session: Arc<Session>,
    shutdown_tx: broadcast::Sender<()>,
    flush_task: Mutex<Option<JoinHandle<()>>>,
}

impl Recorder {
    /// Start a new session for `lobby_id`
    ///
    /// Captures the resync snapshot, appends it as the `Init` record and
    /// starts the periodic flush. The snapshot's lobby and mission events
    /// also open the first batch, so readers of the body see the state the
    /// session started in. Nothing is written if the snapshot cannot be
    /// obtained.
    #[instrument(skip(ctx), fields(session_id))]
    pub async fn init(
        ctx: RecorderContext,
        lobby_id: &str,
        generation: u64,
    ) -> RecorderResult<Self> {
        let snapshot = ctx.snapshots.resync(lobby_id).await.map_err(|e| match e {
            e @ RecorderError::SnapshotUnavailable { .. } => e,
            other => RecorderError::SnapshotUnavailable {
                lobby_id: lobby_id.to_string(),
                reason: other.to_string(),
            },
        })?;

        let session_id = Uuid::new_v4().to_string();
        tracing::Span::current().record("session_id", session_id.as_str());

        let started_at = ctx.clock.now_millis();
        let payload = serde_json::to_string(&snapshot)?;
        ctx.ledger
            .append(&LogRecord::init(&session_id, lobby_id, payload, started_at))
            .await?;

        let seeded: Vec<Event> = [snapshot.lobby_info, snapshot.mission_info]
            .into_iter()
            .flatten()
            .map(|event| event.with_timestamp(started_at))
            .collect();

        let flush_interval = ctx.config.flush_interval;
        let session = Arc::new(Session {
            session_id,
            lobby_id: lobby_id.to_string(),
            generation,
            started_at,
            ctx,
            buffer: Mutex::new(SessionBuffer {
                state: SessionState::Active,
                pending: seeded,
                rollover_requested: false,
            }),
            slot: tokio::sync::Mutex::new(()),
            rollover_build: Mutex::new(None),
        });

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let flush_task = FlushTask::spawn(Arc::clone(&session), flush_interval, shutdown_rx);

        info!(lobby_id, generation, "Recording started");
        Ok(Self {
            session,
            shutdown_tx,
            flush_task: Mutex::new(Some(flush_task)),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session.session_id
    }

    pub fn lobby_id(&self) -> &str {
        &self.session.lobby_id
    }

    pub fn generation(&self) -> u64 {
        self.session.generation
    }

    pub fn state(&self) -> SessionState {
        self.session.buffer.lock().state
    }

    pub fn snapshot(&self) -> RecordingSession {
        let buffer = self.session.buffer.lock();
        RecordingSession {
            session_id: self.session.session_id.clone(),
            lobby_id: self.session.lobby_id.clone(),
            generation: self.session.generation,
            state: buffer.state,
            pending_events: buffer.pending.len(),
        }
    }

    /// Buffer events for the next flush
    ///
    /// Each event is stamped with the current time. Ignored with a warning
    /// once the session is no longer active.
    pub fn record_events(&self, batch: Vec<Event>) {
        self.session.record(batch);
    }

    /// Persist buffered events now
    ///
    /// Returns the number of events written. May roll the session over.
    pub async fn flush(&self) -> RecorderResult<usize> {
        self.session.flush().await
    }

    /// End the session and build its container
    ///
    /// Waits for an in-flight flush. Calling it again is a no-op returning
    /// `None`; after a session ended by a rollover without a listener it
    /// returns the outcome of the rollover build.
    #[instrument(skip(self), fields(session_id = %self.session.session_id))]
    pub async fn stop(&self) -> RecorderResult<Option<BuildOutcome>> {
        // No receiver means the flush task already exited
        let _ = self.shutdown_tx.send(());
        let flush_task = self.flush_task.lock().take();

        let stopped_now = self.session.stop().await?;

        if let Some(handle) = flush_task {
            if let Err(e) = handle.await {
                error!(error = %e, "Flush task panicked");
            }
        }

        if stopped_now {
            info!(lobby_id = %self.session.lobby_id, "Recording stopped");
            return self.session.ctx.builder.build(&self.session.session_id).await.map(Some);
        }

        let rollover_build = self.session.rollover_build.lock().take();
        match rollover_build {
            Some(handle) => handle
                .await
                .map_err(|e| RecorderError::Task(e.to_string()))?
                .map(Some),
            None => Ok(None),
        }
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
    }
}
