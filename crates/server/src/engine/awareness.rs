use std::collections::HashSet;

use anyhow::{Context, Result};
use yrs::sync::{Awareness, AwarenessUpdate};
use yrs::Doc;

/// Client ids touched by one applied awareness update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AwarenessChange {
    pub added: Vec<u64>,
    pub updated: Vec<u64>,
    pub removed: Vec<u64>,
}

impl AwarenessChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    pub fn all(&self) -> Vec<u64> {
        self.added.iter().chain(&self.updated).chain(&self.removed).copied().collect()
    }
}

/// Ephemeral presence states sharing the session's document.
pub struct AwarenessStore {
    awareness: Awareness,
}

impl AwarenessStore {
    pub fn new(doc: Doc) -> Self {
        Self { awareness: Awareness::new(doc) }
    }

    /// Apply a peer update. Stale clocks yield an empty change.
    pub fn apply(&self, update: AwarenessUpdate) -> Result<AwarenessChange> {
        let Some(summary) = self
            .awareness
            .apply_update_summary(update)
            .context("failed to apply awareness update")?
        else {
            return Ok(AwarenessChange::default());
        };

        Ok(AwarenessChange {
            added: summary.added,
            updated: summary.updated,
            removed: summary.removed,
        })
    }

    /// Encode the current entries for `clients` (removed ones as null states).
    pub fn encode_clients(&self, clients: Vec<u64>) -> Result<AwarenessUpdate> {
        self.awareness
            .update_with_clients(clients)
            .context("failed to encode awareness rebroadcast payload")
    }

    /// Drop the states of `ids`. Returns the update announcing the removals,
    /// or `None` when none of them had a state.
    pub fn remove_clients(&self, ids: &HashSet<u64>) -> Result<Option<AwarenessUpdate>> {
        let present: Vec<u64> = self
            .awareness
            .iter()
            .filter(|(client_id, state)| state.data.is_some() && ids.contains(client_id))
            .map(|(client_id, _)| client_id)
            .collect();
        if present.is_empty() {
            return Ok(None);
        }

        for client_id in &present {
            self.awareness.remove_state(*client_id);
        }
        self.encode_clients(present).map(Some)
    }

    /// Every client that currently has a state, for a newly attached peer.
    pub fn snapshot(&self) -> Result<Option<AwarenessUpdate>> {
        let live: Vec<u64> = self
            .awareness
            .iter()
            .filter(|(_, state)| state.data.is_some())
            .map(|(client_id, _)| client_id)
            .collect();
        if live.is_empty() {
            return Ok(None);
        }
        self.encode_clients(live).map(Some)
    }

    pub fn client_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self
            .awareness
            .iter()
            .filter(|(_, state)| state.data.is_some())
            .map(|(client_id, _)| client_id)
            .collect();
        ids.sort_unstable();
        ids
    }
}
