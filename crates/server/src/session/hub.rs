// Session hub: the index from document name to live session.
//
// The index is the single source of truth for which documents are active.
// Lock order is hub index first, then session state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

use super::{ConnectionId, DocumentSession, Lifecycle, ReadySignal};
use crate::config::SessionConfig;
use crate::metrics;
use crate::persistence::DocStore;

/// A connection registered on a session.
pub struct Attachment {
    pub session: Arc<DocumentSession>,
    pub ready: ReadySignal,
    pub connection: ConnectionId,
    /// Frames queued for this connection by replies, broadcasts and saves.
    pub outbound: mpsc::UnboundedReceiver<Vec<u8>>,
}

#[derive(Default)]
struct HubIndex {
    live: HashMap<String, Arc<DocumentSession>>,
    /// Sessions running their final flush. Not visible to `acquire`; kept so
    /// a successor can wait for the flush before loading.
    draining: HashMap<String, Arc<DocumentSession>>,
}

pub struct SessionHub {
    store: Arc<dyn DocStore>,
    config: SessionConfig,
    index: Mutex<HubIndex>,
    next_connection_id: AtomicU64,
}

impl SessionHub {
    pub fn new(store: Arc<dyn DocStore>, config: SessionConfig) -> Self {
        Self {
            store,
            config,
            index: Mutex::new(HubIndex::default()),
            next_connection_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn DocStore> {
        &self.store
    }

    /// Look up the live session for `name`, creating and loading a new one
    /// if there is none (or the existing one failed to load).
    ///
    /// Only a registered connection can drain a session, so callers outside
    /// the hub go through `connect`.
    pub(crate) async fn acquire(&self, name: &str) -> (Arc<DocumentSession>, ReadySignal) {
        let mut index = self.index.lock().await;
        let session = self.acquire_locked(&mut index, name);
        let ready = session.ready_signal();
        (session, ready)
    }

    /// Acquire the session for `name` and register a new connection on it
    /// in one step, so the session cannot drain in between.
    pub async fn connect(&self, name: &str) -> Attachment {
        let connection = self.next_connection_id.fetch_add(1, Ordering::SeqCst);
        let (outbound_tx, outbound) = mpsc::unbounded_channel();

        let mut index = self.index.lock().await;
        let session = self.acquire_locked(&mut index, name);
        session.attach(connection, outbound_tx).await;
        drop(index);

        metrics::connection_opened();
        debug!(doc = name, connection, "connection attached");
        Attachment { ready: session.ready_signal(), session, connection, outbound }
    }

    /// Deregister a connection. When it was the last one, the session is
    /// removed from the index, flushed and destroyed before this returns.
    /// Releasing the same connection twice is a no-op.
    pub async fn release(&self, session: &Arc<DocumentSession>, connection: ConnectionId) {
        let name = session.name();
        let mut index = self.index.lock().await;
        let Some(now_empty) = session.detach(connection).await else {
            return;
        };
        metrics::connection_closed();
        debug!(doc = name, connection, "connection released");
        if !now_empty {
            return;
        }

        if index.live.get(name).is_some_and(|live| Arc::ptr_eq(live, session)) {
            index.live.remove(name);
        }
        if !matches!(session.lifecycle(), Lifecycle::Failed(_)) {
            index.draining.insert(name.to_string(), Arc::clone(session));
        }
        metrics::set_active_sessions(index.live.len());
        drop(index);

        session.drain().await;

        let mut index = self.index.lock().await;
        if index.draining.get(name).is_some_and(|draining| Arc::ptr_eq(draining, session)) {
            index.draining.remove(name);
        }
    }

    /// The live session for `name`, if any. Draining sessions are not live.
    pub async fn session(&self, name: &str) -> Option<Arc<DocumentSession>> {
        self.index.lock().await.live.get(name).cloned()
    }

    pub async fn active_sessions(&self) -> usize {
        self.index.lock().await.live.len()
    }

    pub async fn draining_sessions(&self) -> usize {
        self.index.lock().await.draining.len()
    }

    /// Flush every live session and wait for in-flight drains. Used on
    /// process shutdown, before the store is closed.
    pub async fn shutdown(&self) {
        let (live, draining): (Vec<_>, Vec<_>) = {
            let index = self.index.lock().await;
            (index.live.values().cloned().collect(), index.draining.values().cloned().collect())
        };

        for session in live {
            let outcome = session.flush().await;
            info!(doc = session.name(), ?outcome, "flushed session on shutdown");
        }
        for session in draining {
            session.wait_destroyed().await;
        }
    }

    fn acquire_locked(&self, index: &mut HubIndex, name: &str) -> Arc<DocumentSession> {
        if let Some(existing) = index.live.get(name) {
            if !matches!(existing.lifecycle(), Lifecycle::Failed(_)) {
                return Arc::clone(existing);
            }
        }

        let predecessor = index.draining.get(name).cloned();
        let session = DocumentSession::spawn(
            name,
            self.config.clone(),
            Arc::clone(&self.store),
            predecessor,
        );
        index.live.insert(name.to_string(), Arc::clone(&session));
        metrics::set_active_sessions(index.live.len());
        info!(doc = name, "created document session");
        session
    }
}
