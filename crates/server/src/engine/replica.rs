// Replicated document wrapper using yrs (y-crdt Rust bindings).

use anyhow::{Context, Result};
use yrs::sync::SyncMessage;
use yrs::updates::decoder::Decode;
use yrs::{Any, Doc, Map, Options, Out, ReadTxn, StateVector, Text, Transact, Update};

pub const TEXT_NAME: &str = "monaco";
pub const INITIALIZED_KEY: &str = "isInitialized";

/// Encoded update carrying no structs and no deletions.
const EMPTY_UPDATE: [u8; 2] = [0, 0];

/// What applying one sync message produced.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SyncOutcome {
    /// Direct reply for the sender (step-2 answering a step-1).
    pub reply: Option<SyncMessage>,
    /// Changes the message actually made, encoded for fan-out to every
    /// connection. `None` when it carried nothing new.
    pub update: Option<Vec<u8>>,
}

/// In-memory replica of one named document.
pub struct Replica {
    doc: Doc,
}

impl Replica {
    pub fn new(gc_enabled: bool) -> Self {
        let options = Options { skip_gc: !gc_enabled, ..Default::default() };
        Self { doc: Doc::with_options(options) }
    }

    /// Create a replica with a specific client ID (for deterministic testing).
    pub fn with_client_id(client_id: u64) -> Self {
        let options = Options { client_id, ..Default::default() };
        Self { doc: Doc::with_options(options) }
    }

    /// Merge a v1-encoded update (or full state) into the replica.
    pub fn merge(&self, data: &[u8]) -> Result<()> {
        let update = Update::decode_v1(data).context("failed to decode document update")?;
        self.doc.transact_mut().apply_update(update).context("failed to apply document update")?;
        Ok(())
    }

    /// Apply an update and re-encode what it changed in this replica. Content
    /// the replica already holds encodes as the empty update.
    fn integrate(&self, data: &[u8]) -> Result<Vec<u8>> {
        let update = Update::decode_v1(data).context("failed to decode document update")?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(update).context("failed to apply document update")?;
        Ok(txn.encode_update_v1())
    }

    /// Encode the full document state as a v1 update.
    pub fn encode_state(&self) -> Vec<u8> {
        self.doc.transact().encode_state_as_update_v1(&StateVector::default())
    }

    pub fn state_vector(&self) -> StateVector {
        self.doc.transact().state_vector()
    }

    /// Apply one sync sub-message from a peer.
    pub fn apply_sync(&self, message: SyncMessage) -> Result<SyncOutcome> {
        match message {
            SyncMessage::SyncStep1(remote_sv) => {
                let diff = self.doc.transact().encode_diff_v1(&remote_sv);
                Ok(SyncOutcome { reply: Some(SyncMessage::SyncStep2(diff)), update: None })
            }
            SyncMessage::SyncStep2(data) | SyncMessage::Update(data) => {
                let applied = self.integrate(&data)?;
                let update = (applied.as_slice() != EMPTY_UPDATE).then_some(applied);
                Ok(SyncOutcome { reply: None, update })
            }
        }
    }

    pub fn is_initialized(&self) -> bool {
        let flags = self.doc.get_or_insert_map(INITIALIZED_KEY);
        let txn = self.doc.transact();
        matches!(flags.get(&txn, INITIALIZED_KEY), Some(Out::Any(Any::Bool(true))))
    }

    /// Insert starter content and mark the document initialized in one transaction.
    pub fn seed(&self, content: &str) {
        let text = self.doc.get_or_insert_text(TEXT_NAME);
        let flags = self.doc.get_or_insert_map(INITIALIZED_KEY);
        let mut txn = self.doc.transact_mut();
        text.insert(&mut txn, 0, content);
        flags.insert(&mut txn, INITIALIZED_KEY, true);
    }

    /// Get the underlying Doc reference (shared with awareness).
    pub fn inner(&self) -> &Doc {
        &self.doc
    }
}
