//! Live document sessions: one replica per document name, the connections
//! attached to it, and its persistence lifecycle.

pub mod hub;
pub mod protocol;
pub mod registry;

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use docsync_common::protocol::{encode_awareness, encode_saved, encode_sync};
use tokio::sync::{broadcast, watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use yrs::sync::SyncMessage;

use crate::config::SessionConfig;
use crate::engine::{defaults::default_content, AwarenessStore, Replica};
use crate::error::SessionError;
use crate::metrics;
use crate::persistence::scheduler::ScheduledSave;
use crate::persistence::{DocStore, PersistenceScheduler};

pub use hub::{Attachment, SessionHub};
pub use registry::{ConnectionId, ConnectionRegistry, Outbound};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Load/persistence lifecycle of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lifecycle {
    Loading,
    Ready,
    /// The load attempt failed; the session never becomes ready.
    Failed(String),
    Draining,
    Destroyed,
}

/// Observable side effects of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    FrameRejected { connection: ConnectionId, error: String },
    Saved { bytes: usize },
    SaveSkipped { bytes: usize },
    SaveFailed { error: String },
}

/// Result of one save attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved { bytes: usize },
    /// Encoded state exceeded the size ceiling; nothing was stored.
    Skipped { bytes: usize },
    /// The stored state has not been merged yet, so saving would clobber it.
    NotLoaded,
    Failed { error: String },
}

/// Resolves once a session has left `Loading`.
#[derive(Debug, Clone)]
pub struct ReadySignal {
    name: String,
    lifecycle: watch::Receiver<Lifecycle>,
}

impl ReadySignal {
    pub async fn wait(&mut self) -> Result<(), SessionError> {
        let state = self
            .lifecycle
            .wait_for(|state| *state != Lifecycle::Loading)
            .await
            .map_err(|_| SessionError::Closed)?
            .clone();
        match state {
            Lifecycle::Ready => Ok(()),
            Lifecycle::Failed(message) => {
                Err(SessionError::LoadFailed { name: self.name.clone(), message })
            }
            Lifecycle::Loading | Lifecycle::Draining | Lifecycle::Destroyed => {
                Err(SessionError::Closed)
            }
        }
    }

    pub fn is_ready(&self) -> bool {
        *self.lifecycle.borrow() == Lifecycle::Ready
    }
}

struct SessionState {
    replica: Replica,
    awareness: AwarenessStore,
    connections: ConnectionRegistry,
    /// Set once stored bytes have been merged. Saves before that point would
    /// overwrite durable state with an empty document.
    loaded: bool,
    last_mutation: Option<Instant>,
}

/// One live document.
pub struct DocumentSession {
    name: String,
    config: SessionConfig,
    store: Arc<dyn DocStore>,
    state: Mutex<SessionState>,
    lifecycle: watch::Sender<Lifecycle>,
    events: broadcast::Sender<SessionEvent>,
    scheduler: PersistenceScheduler,
    save_lock: Mutex<()>,
}

impl DocumentSession {
    /// Create a session and start loading it. When `predecessor` is a
    /// session for the same name that is still draining, the load waits for
    /// its final flush.
    pub(crate) fn spawn(
        name: &str,
        config: SessionConfig,
        store: Arc<dyn DocStore>,
        predecessor: Option<Arc<DocumentSession>>,
    ) -> Arc<Self> {
        let replica = Replica::new(config.gc_enabled);
        let awareness = AwarenessStore::new(replica.inner().clone());
        let (lifecycle, _) = watch::channel(Lifecycle::Loading);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let scheduler = PersistenceScheduler::new(config.save_quiet, config.save_max_wait);

        let session = Arc::new(Self {
            name: name.to_string(),
            config,
            store,
            state: Mutex::new(SessionState {
                replica,
                awareness,
                connections: ConnectionRegistry::new(),
                loaded: false,
                last_mutation: None,
            }),
            lifecycle,
            events,
            scheduler,
            save_lock: Mutex::new(()),
        });

        session.scheduler.start(Arc::downgrade(&session));
        let loader = Arc::clone(&session);
        tokio::spawn(async move {
            loader.load(predecessor).await;
        });
        session
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle.borrow().clone()
    }

    pub fn ready_signal(&self) -> ReadySignal {
        ReadySignal { name: self.name.clone(), lifecycle: self.lifecycle.subscribe() }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub async fn connection_count(&self) -> usize {
        self.state.lock().await.connections.len()
    }

    pub async fn last_mutation(&self) -> Option<Instant> {
        self.state.lock().await.last_mutation
    }

    /// Full encoded state of the replica.
    pub async fn encode_state(&self) -> Vec<u8> {
        self.state.lock().await.replica.encode_state()
    }

    /// Awareness client ids currently attributed to `connection`.
    pub async fn controlled_ids(&self, connection: ConnectionId) -> Option<HashSet<u64>> {
        self.state.lock().await.connections.controlled(connection).cloned()
    }

    async fn load(&self, predecessor: Option<Arc<DocumentSession>>) {
        if let Some(predecessor) = predecessor {
            debug!(doc = %self.name, "waiting for draining predecessor before load");
            predecessor.wait_destroyed().await;
        }

        let started = Instant::now();
        let stored = match self.store.load(&self.name).await {
            Ok(stored) => stored,
            Err(err) => {
                error!(doc = %self.name, error = %err, "document load failed");
                self.lifecycle.send_replace(Lifecycle::Failed(err.to_string()));
                return;
            }
        };
        metrics::observe_doc_load(started.elapsed());

        let seeded = {
            let mut state = self.state.lock().await;
            if let Some(bytes) = stored.as_deref() {
                if let Err(err) = state.replica.merge(bytes) {
                    let message = format!("{err:#}");
                    error!(doc = %self.name, error = %message, "stored document state is corrupt");
                    self.lifecycle.send_replace(Lifecycle::Failed(message));
                    return;
                }
            }
            state.loaded = true;

            match default_content(&self.name) {
                Some(content) if !state.replica.is_initialized() => {
                    state.replica.seed(content);
                    true
                }
                _ => false,
            }
        };

        if seeded {
            debug!(doc = %self.name, "seeded default content");
            if let outcome @ (SaveOutcome::Skipped { .. } | SaveOutcome::Failed { .. }) =
                self.save().await
            {
                warn!(doc = %self.name, ?outcome, "initial save of seeded document incomplete");
                self.scheduler.kick();
            }
        }

        info!(
            doc = %self.name,
            stored_bytes = stored.as_ref().map_or(0, Vec::len),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "document loaded"
        );
        self.lifecycle.send_replace(Lifecycle::Ready);
    }

    /// Register a connection. Called by the hub while it holds its index lock.
    pub(crate) async fn attach(&self, connection: ConnectionId, outbound: Outbound) -> bool {
        self.state.lock().await.connections.insert(connection, outbound)
    }

    /// Deregister a connection and announce the removal of the awareness
    /// states it controlled. Returns whether the registry is now empty, or
    /// `None` if the connection was not registered.
    pub(crate) async fn detach(&self, connection: ConnectionId) -> Option<bool> {
        let mut state = self.state.lock().await;
        let controlled = state.connections.remove(connection)?;

        if !controlled.is_empty() {
            match state.awareness.remove_clients(&controlled) {
                Ok(Some(update)) => {
                    state.connections.broadcast(&encode_awareness(update));
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(
                        doc = %self.name,
                        connection,
                        error = %format!("{err:#}"),
                        "failed to announce awareness removal"
                    );
                }
            }
        }

        Some(state.connections.is_empty())
    }

    /// Queue the initial sync request and the awareness snapshot for a
    /// connection whose document just became ready.
    pub async fn send_handshake(&self, connection: ConnectionId) -> Result<(), SessionError> {
        let state = self.state.lock().await;
        let step1 = encode_sync(SyncMessage::SyncStep1(state.replica.state_vector()));
        if !state.connections.send_to(connection, step1) {
            return Err(SessionError::Closed);
        }

        match state.awareness.snapshot() {
            Ok(Some(snapshot)) => {
                state.connections.send_to(connection, encode_awareness(snapshot));
            }
            Ok(None) => {}
            Err(err) => {
                warn!(
                    doc = %self.name,
                    connection,
                    error = %format!("{err:#}"),
                    "failed to encode awareness snapshot"
                );
            }
        }
        Ok(())
    }

    /// Persist the current state unless it exceeds the size ceiling. Saves
    /// are serialized per session.
    pub async fn save(&self) -> SaveOutcome {
        let _guard = self.save_lock.lock().await;

        let encoded = {
            let state = self.state.lock().await;
            if !state.loaded {
                return SaveOutcome::NotLoaded;
            }
            state.replica.encode_state()
        };
        let bytes = encoded.len();

        if bytes > self.config.max_doc_bytes {
            warn!(
                doc = %self.name,
                bytes,
                limit = self.config.max_doc_bytes,
                "document too large, skipping persistence"
            );
            metrics::increment_save_skipped();
            self.emit(SessionEvent::SaveSkipped { bytes });
            return SaveOutcome::Skipped { bytes };
        }

        let started = Instant::now();
        match self.store.store(&self.name, &encoded).await {
            Ok(()) => {
                metrics::observe_doc_store(started.elapsed());
                self.state.lock().await.connections.broadcast(&encode_saved());
                debug!(doc = %self.name, bytes, "document saved");
                self.emit(SessionEvent::Saved { bytes });
                SaveOutcome::Saved { bytes }
            }
            Err(err) => {
                error!(doc = %self.name, bytes, error = %err, "document save failed");
                metrics::increment_save_failed();
                let error = err.to_string();
                self.emit(SessionEvent::SaveFailed { error: error.clone() });
                SaveOutcome::Failed { error }
            }
        }
    }

    /// Drop any pending debounced save and save immediately.
    pub async fn flush(&self) -> SaveOutcome {
        self.scheduler.clear_pending();
        self.save().await
    }

    /// Final flush after the last connection left. Waits for the load attempt
    /// to settle first so the flush never races the merge of stored bytes.
    pub(crate) async fn drain(&self) {
        let mut lifecycle = self.lifecycle.subscribe();
        let load_failed = match lifecycle.wait_for(|state| *state != Lifecycle::Loading).await {
            Ok(state) => matches!(*state, Lifecycle::Failed(_)),
            Err(_) => true,
        };

        self.lifecycle.send_replace(Lifecycle::Draining);
        self.scheduler.cancel();

        if !load_failed {
            let started = Instant::now();
            let outcome = self.save().await;
            let size = match outcome {
                SaveOutcome::Saved { bytes } | SaveOutcome::Skipped { bytes } => bytes,
                SaveOutcome::NotLoaded | SaveOutcome::Failed { .. } => 0,
            };
            metrics::observe_drain_persist(started.elapsed(), size);
            info!(doc = %self.name, ?outcome, "session drained");
        }

        self.lifecycle.send_replace(Lifecycle::Destroyed);
    }

    pub async fn wait_destroyed(&self) {
        let mut lifecycle = self.lifecycle.subscribe();
        let _ = lifecycle.wait_for(|state| *state == Lifecycle::Destroyed).await;
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl ScheduledSave for DocumentSession {
    async fn scheduled_save(&self) {
        if matches!(self.lifecycle(), Lifecycle::Draining | Lifecycle::Destroyed) {
            return;
        }
        self.save().await;
    }
}
