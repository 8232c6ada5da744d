#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use docsync_common::protocol::{encode_awareness, encode_sync};
use docsync_server::error::PersistenceError;
use docsync_server::persistence::{DocStore, MemoryDocStore};
use tokio::sync::watch;
use yrs::sync::{Awareness, SyncMessage};
use yrs::{Doc, GetString, Text, Transact};

/// Memory store whose loads and stores can be held back until opened.
pub struct GatedStore {
    pub inner: MemoryDocStore,
    load_gate: watch::Sender<bool>,
    store_gate: watch::Sender<bool>,
    fail_loads: AtomicBool,
    pub failed_loads: AtomicUsize,
}

impl GatedStore {
    pub fn open() -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryDocStore::new(),
            load_gate: watch::channel(true).0,
            store_gate: watch::channel(true).0,
            fail_loads: AtomicBool::new(false),
            failed_loads: AtomicUsize::new(0),
        })
    }

    pub fn set_loads_open(&self, open: bool) {
        self.load_gate.send_replace(open);
    }

    pub fn set_stores_open(&self, open: bool) {
        self.store_gate.send_replace(open);
    }

    pub fn set_fail_loads(&self, fail: bool) {
        self.fail_loads.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl DocStore for GatedStore {
    async fn load(&self, name: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
        let mut gate = self.load_gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;
        if self.fail_loads.load(Ordering::SeqCst) {
            self.failed_loads.fetch_add(1, Ordering::SeqCst);
            return Err(PersistenceError::Closed);
        }
        self.inner.load(name).await
    }

    async fn store(&self, name: &str, state: &[u8]) -> Result<(), PersistenceError> {
        let mut gate = self.store_gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;
        self.inner.store(name, state).await
    }
}

/// Let spawned tasks on the current-thread runtime make progress.
pub async fn settle() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}

/// A client-side replica producing update frames.
pub struct Client {
    pub doc: Doc,
}

impl Client {
    pub fn new(client_id: u64) -> Self {
        Self { doc: Doc::with_client_id(client_id) }
    }

    /// Append `content` to the shared text and return the encoded sync frame.
    pub fn push_frame(&self, content: &str) -> Vec<u8> {
        let text = self.doc.get_or_insert_text("monaco");
        let mut txn = self.doc.transact_mut();
        text.push(&mut txn, content);
        encode_sync(SyncMessage::Update(txn.encode_update_v1()))
    }

    pub fn text(&self) -> String {
        text_of(&self.doc)
    }
}

pub fn text_of(doc: &Doc) -> String {
    let text = doc.get_or_insert_text("monaco");
    let txn = doc.transact();
    text.get_string(&txn)
}

/// Text held by an encoded document state.
pub fn text_of_state(state: &[u8]) -> String {
    use yrs::updates::decoder::Decode;

    let doc = Doc::new();
    let update = yrs::Update::decode_v1(state).expect("state should decode");
    doc.transact_mut().apply_update(update).expect("state should apply");
    text_of(&doc)
}

/// Encoded awareness frame announcing a state for `client_id`.
pub fn awareness_frame(client_id: u64, state: &str) -> Vec<u8> {
    let awareness = Awareness::new(Doc::with_client_id(client_id));
    awareness.set_local_state(state).expect("awareness state should serialize");
    encode_awareness(awareness.update().expect("awareness update should encode"))
}

/// Awareness frames for `client_id` announcing `state` and then withdrawing
/// it with a newer clock.
pub fn awareness_announce_and_withdraw(client_id: u64, state: &str) -> (Vec<u8>, Vec<u8>) {
    let awareness = Awareness::new(Doc::with_client_id(client_id));
    awareness.set_local_state(state).expect("awareness state should serialize");
    let announce = encode_awareness(awareness.update().expect("awareness update should encode"));

    awareness.remove_state(client_id);
    let withdraw = awareness
        .update_with_clients(vec![client_id])
        .expect("awareness removal should encode");
    (announce, encode_awareness(withdraw))
}
