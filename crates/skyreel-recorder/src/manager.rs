//! Lobby lifecycle coordination
//!
//! The [`LobbyManager`] keeps one live [`Recorder`] per connected lobby,
//! routes incoming event batches to it, and starts the next generation when
//! a session rolls over.

use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use skyreel_core::Event;

use crate::builder::BuildOutcome;
use crate::error::RecorderResult;
use crate::extract;
use crate::library::ReplayLibrary;
use crate::recorder::{Recorder, RecorderContext, RolloverRequest};

/// One recorder per connected lobby
pub struct LobbyManager {
    ctx: RecorderContext,
    /// Serializes connect, disconnect and restart
    lifecycle: Mutex<()>,
    recorders: DashMap<String, Arc<Recorder>>,
    /// Last generation used per lobby
    generations: DashMap<String, u64>,
    shutdown_tx: broadcast::Sender<()>,
}

impl LobbyManager {
    /// Create the manager and start handling rollover requests
    pub fn spawn(ctx: RecorderContext) -> Arc<Self> {
        let (rollover_tx, rollover_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = broadcast::channel(1);

        let manager = Arc::new(Self {
            ctx: ctx.with_rollover_channel(rollover_tx),
            lifecycle: Mutex::new(()),
            recorders: DashMap::new(),
            generations: DashMap::new(),
            shutdown_tx,
        });

        let shutdown_rx = manager.shutdown_tx.subscribe();
        tokio::spawn(Self::run_rollovers(
            Arc::downgrade(&manager),
            rollover_rx,
            shutdown_rx,
        ));
        manager
    }

    async fn run_rollovers(
        manager: Weak<Self>,
        mut rollover_rx: mpsc::UnboundedReceiver<RolloverRequest>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                request = rollover_rx.recv() => {
                    let Some(request) = request else { break };
                    let Some(manager) = manager.upgrade() else { break };
                    manager.handle_rollover(request).await;
                }
            }
        }
        debug!("Rollover handler stopped");
    }

    async fn handle_rollover(&self, request: RolloverRequest) {
        let current = self
            .recorders
            .get(&request.lobby_id)
            .map(|r| r.session_id().to_string());
        if current.as_deref() != Some(request.session_id.as_str()) {
            debug!(
                lobby_id = %request.lobby_id,
                session_id = %request.session_id,
                "Ignoring rollover of a replaced session"
            );
            return;
        }

        info!(
            lobby_id = %request.lobby_id,
            generation = request.generation,
            "Session reached its maximum duration"
        );
        if let Err(e) = self.restart(&request.lobby_id).await {
            error!(lobby_id = %request.lobby_id, error = %e, "Failed to start next generation");
        }
    }

    /// Start recording a lobby
    ///
    /// Returns the session id; an already recorded lobby keeps its session.
    #[instrument(skip(self))]
    pub async fn lobby_connected(&self, lobby_id: &str) -> RecorderResult<String> {
        let _guard = self.lifecycle.lock().await;
        if let Some(existing) = self.recorders.get(lobby_id) {
            debug!("Lobby already recording");
            return Ok(existing.session_id().to_string());
        }
        let recorder = self.start_generation(lobby_id).await?;
        let session_id = recorder.session_id().to_string();
        self.recorders.insert(lobby_id.to_string(), recorder);
        Ok(session_id)
    }

    /// Stop recording a lobby and build its container
    #[instrument(skip(self))]
    pub async fn lobby_disconnected(&self, lobby_id: &str) -> RecorderResult<Option<BuildOutcome>> {
        let _guard = self.lifecycle.lock().await;
        let Some((_, recorder)) = self.recorders.remove(lobby_id) else {
            debug!("Lobby was not recording");
            return Ok(None);
        };
        recorder.stop().await
    }

    /// Route an event batch to the lobby's recorder
    pub fn lobby_data(&self, lobby_id: &str, events: Vec<Event>) {
        match self.recorders.get(lobby_id) {
            Some(recorder) => recorder.record_events(events),
            None => warn!(lobby_id, dropped = events.len(), "Data for unknown lobby"),
        }
    }

    /// Replace the lobby's session with a new generation
    ///
    /// The new session is live before the old one is stopped, so no batch
    /// routed in between is lost.
    #[instrument(skip(self))]
    pub async fn restart(&self, lobby_id: &str) -> RecorderResult<String> {
        let _guard = self.lifecycle.lock().await;
        let recorder = self.start_generation(lobby_id).await?;
        let session_id = recorder.session_id().to_string();
        let previous = self.recorders.insert(lobby_id.to_string(), recorder);

        if let Some(previous) = previous {
            match previous.stop().await {
                Ok(outcome) => debug!(
                    previous = %previous.session_id(),
                    finalized = outcome.as_ref().is_some_and(|o| o.header().is_some()),
                    "Previous generation stopped"
                ),
                Err(e) => error!(
                    previous = %previous.session_id(),
                    error = %e,
                    "Failed to stop previous generation"
                ),
            }
        }
        Ok(session_id)
    }

    async fn start_generation(&self, lobby_id: &str) -> RecorderResult<Arc<Recorder>> {
        let generation = self
            .generations
            .get(lobby_id)
            .map(|g| *g + 1)
            .unwrap_or(0);
        let recorder = Recorder::init(self.ctx.clone(), lobby_id, generation).await?;
        self.generations.insert(lobby_id.to_string(), generation);
        Ok(Arc::new(recorder))
    }

    /// Lobbies currently recording, sorted
    pub fn active_lobbies(&self) -> Vec<String> {
        let mut lobbies: Vec<String> = self.recorders.iter().map(|e| e.key().clone()).collect();
        lobbies.sort();
        lobbies
    }

    pub fn recorder(&self, lobby_id: &str) -> Option<Arc<Recorder>> {
        self.recorders.get(lobby_id).map(|r| Arc::clone(r.value()))
    }

    /// Extract metadata of every container finalized from now on
    pub fn spawn_metadata_listener(&self, library: Arc<ReplayLibrary>) -> JoinHandle<()> {
        extract::spawn_metadata_listener(
            self.ctx.builder.subscribe(),
            library,
            self.shutdown_tx.subscribe(),
        )
    }

    /// Stop every recorder and background task
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        let _guard = self.lifecycle.lock().await;
        let lobbies: Vec<String> = self.recorders.iter().map(|e| e.key().clone()).collect();
        for lobby_id in lobbies {
            if let Some((_, recorder)) = self.recorders.remove(&lobby_id) {
                if let Err(e) = recorder.stop().await {
                    error!(lobby_id = %lobby_id, error = %e, "Failed to stop recorder");
                }
            }
        }
        let _ = self.shutdown_tx.send(());
        info!("Lobby manager shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use serde_json::json;
    use skyreel_core::{Catalog, Ledger, Lz4JsonCodec, ManualClock};
    use skyreel_storage::{InMemoryCatalog, InMemoryLedger, InMemoryObjectStore};

    use crate::builder::ContainerBuilder;
    use crate::config::RecorderConfig;
    use crate::recorder::StaticSnapshotSource;

    struct Fixture {
        ledger: Arc<InMemoryLedger>,
        objects: InMemoryObjectStore,
        catalog: Arc<InMemoryCatalog>,
        clock: Arc<ManualClock>,
        manager: Arc<LobbyManager>,
    }

    fn fixture(config: RecorderConfig) -> Fixture {
        let ledger = Arc::new(InMemoryLedger::new());
        let objects = InMemoryObjectStore::new();
        let catalog = Arc::new(InMemoryCatalog::new());
        let clock = Arc::new(ManualClock::new(0));
        let builder = Arc::new(ContainerBuilder::new(
            ledger.clone(),
            Arc::new(objects.clone()),
            catalog.clone(),
        ));
        let ctx = RecorderContext::new(
            ledger.clone(),
            Arc::new(Lz4JsonCodec::new()),
            Arc::new(StaticSnapshotSource::default()),
            builder,
        )
        .with_clock(clock.clone())
        .with_config(config);
        Fixture {
            ledger,
            objects,
            catalog,
            clock,
            manager: LobbyManager::spawn(ctx),
        }
    }

    fn rollover_config() -> RecorderConfig {
        RecorderConfig::default()
            .with_flush_interval(Duration::from_secs(3_600))
            .with_max_session_duration(Duration::from_secs(60))
    }

    /// Wait for the rollover handler to swap in a session other than `previous`
    async fn next_session(manager: &LobbyManager, previous: &str) -> Arc<Recorder> {
        for _ in 0..100 {
            let current = manager.recorder("lobby-1").unwrap();
            if current.session_id() != previous {
                return current;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("rollover did not start a new session");
    }

    async fn wait_catalogued(catalog: &InMemoryCatalog, id: &str) {
        for _ in 0..100 {
            if catalog.lookup(id).await.unwrap().is_some() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("container {id} was not catalogued");
    }

    fn event(i: u64) -> Event {
        Event::new("PlayerVehicle", "Move", vec![json!(i)])
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let f = fixture(RecorderConfig::default());
        let first = f.manager.lobby_connected("lobby-1").await.unwrap();
        let second = f.manager.lobby_connected("lobby-1").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(f.manager.active_lobbies(), vec!["lobby-1"]);
        f.manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_disconnect_builds_container() {
        let f = fixture(RecorderConfig::default());
        let session_id = f.manager.lobby_connected("lobby-1").await.unwrap();
        f.manager.lobby_data("lobby-1", vec![event(1), event(2)]);
        f.manager.lobby_data("unknown", vec![event(3)]);

        let outcome = f.manager.lobby_disconnected("lobby-1").await.unwrap().unwrap();
        let header = outcome.header().unwrap();
        assert_eq!(header.id, session_id);
        assert_eq!(header.chunks.len(), 1);
        assert!(f.manager.active_lobbies().is_empty());
        assert!(f.ledger.sessions_with_init().await.unwrap().is_empty());

        assert!(f.manager.lobby_disconnected("lobby-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_restart_bumps_generation() {
        let f = fixture(RecorderConfig::default());
        let first = f.manager.lobby_connected("lobby-1").await.unwrap();
        let second = f.manager.restart("lobby-1").await.unwrap();
        assert_ne!(first, second);

        let recorder = f.manager.recorder("lobby-1").unwrap();
        assert_eq!(recorder.generation(), 1);
        assert!(f.catalog.lookup(&first).await.unwrap().is_some());
        f.manager.shutdown().await;
        assert!(f.catalog.lookup(&second).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_rollover_starts_next_generation() {
        let f = fixture(rollover_config());
        let first = f.manager.lobby_connected("lobby-1").await.unwrap();
        f.manager.lobby_data("lobby-1", vec![event(1)]);
        f.clock.advance(Duration::from_secs(61));
        f.manager.recorder("lobby-1").unwrap().flush().await.unwrap();

        let next = next_session(&f.manager, &first).await;
        assert_eq!(next.generation(), 1);
        wait_catalogued(&f.catalog, &first).await;
        f.manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_no_events_lost_across_rollover() {
        let f = fixture(rollover_config());
        let first = f.manager.lobby_connected("lobby-1").await.unwrap();
        f.manager.lobby_data("lobby-1", vec![event(1)]);
        f.clock.advance(Duration::from_secs(61));
        f.manager.recorder("lobby-1").unwrap().flush().await.unwrap();

        // Routed before the next generation is live
        f.manager.lobby_data("lobby-1", vec![event(2)]);

        let next = next_session(&f.manager, &first).await;
        f.manager.lobby_data("lobby-1", vec![event(3)]);
        wait_catalogued(&f.catalog, &first).await;
        let outcome = f.manager.lobby_disconnected("lobby-1").await.unwrap().unwrap();
        assert_eq!(outcome.header().unwrap().id, next.session_id());

        let library = ReplayLibrary::new(
            Arc::new(f.objects.clone()),
            f.catalog.clone(),
            Arc::new(Lz4JsonCodec::new()),
        );
        let mut args = Vec::new();
        for id in [first.as_str(), next.session_id()] {
            let mut events: Vec<Event> = Vec::new();
            library.read_events(id, &mut events).await.unwrap();
            args.extend(events.into_iter().map(|e| e.args[0].clone()));
        }
        assert_eq!(args, vec![json!(1), json!(2), json!(3)]);
    }
}
