// Connection registry: the live connections of one document session and the
// awareness client ids each of them controls.

use std::collections::{HashMap, HashSet};

use tokio::sync::mpsc;

pub type ConnectionId = u64;

/// Outbound half of a connection: encoded frames awaiting transmission.
pub type Outbound = mpsc::UnboundedSender<Vec<u8>>;

#[derive(Debug)]
struct ConnectionEntry {
    outbound: Outbound,
    controlled: HashSet<u64>,
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: HashMap<ConnectionId, ConnectionEntry>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection. Returns false if the id is already present.
    pub fn insert(&mut self, id: ConnectionId, outbound: Outbound) -> bool {
        if self.connections.contains_key(&id) {
            return false;
        }
        self.connections.insert(id, ConnectionEntry { outbound, controlled: HashSet::new() });
        true
    }

    /// Deregister a connection, handing back the client ids it controlled.
    pub fn remove(&mut self, id: ConnectionId) -> Option<HashSet<u64>> {
        self.connections.remove(&id).map(|entry| entry.controlled)
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    /// Queue a frame for one connection. False if it is gone or its
    /// transport task has stopped reading.
    pub fn send_to(&self, id: ConnectionId, frame: Vec<u8>) -> bool {
        self.connections.get(&id).is_some_and(|entry| entry.outbound.send(frame).is_ok())
    }

    /// Queue a frame for every connection, including the originator.
    /// Returns how many connections accepted it.
    ///
    /// A closed outbound channel means that connection's driver has already
    /// exited; its own release path removes it, so it is only skipped here.
    pub fn broadcast(&self, frame: &[u8]) -> usize {
        self.connections
            .values()
            .filter(|entry| !entry.outbound.is_closed())
            .filter(|entry| entry.outbound.send(frame.to_vec()).is_ok())
            .count()
    }

    /// Attribute awareness client ids to the connection that announced them.
    pub fn claim(&mut self, id: ConnectionId, client_ids: &[u64]) {
        if let Some(entry) = self.connections.get_mut(&id) {
            entry.controlled.extend(client_ids.iter().copied());
        }
    }

    pub fn release_ids(&mut self, id: ConnectionId, client_ids: &[u64]) {
        if let Some(entry) = self.connections.get_mut(&id) {
            for client_id in client_ids {
                entry.controlled.remove(client_id);
            }
        }
    }

    pub fn controlled(&self, id: ConnectionId) -> Option<&HashSet<u64>> {
        self.connections.get(&id).map(|entry| &entry.controlled)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use tokio::sync::mpsc;

    use super::ConnectionRegistry;

    #[test]
    fn insert_rejects_duplicate_ids() {
        let mut registry = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();

        assert!(registry.insert(1, tx.clone()));
        assert!(!registry.insert(1, tx));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn broadcast_reaches_every_open_connection() {
        let mut registry = ConnectionRegistry::new();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let (tx_c, rx_c) = mpsc::unbounded_channel();
        registry.insert(1, tx_a);
        registry.insert(2, tx_b);
        registry.insert(3, tx_c);
        drop(rx_c);

        assert_eq!(registry.broadcast(&[100]), 2);
        assert_eq!(rx_a.try_recv().expect("a receives"), vec![100]);
        assert_eq!(rx_b.try_recv().expect("b receives"), vec![100]);
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn send_to_targets_a_single_connection() {
        let mut registry = ConnectionRegistry::new();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        registry.insert(1, tx_a);
        registry.insert(2, tx_b);

        assert!(registry.send_to(2, vec![0, 0, 1, 0]));
        assert!(!registry.send_to(9, vec![0]));
        assert!(rx_a.try_recv().is_err());
        assert_eq!(rx_b.try_recv().expect("b receives"), vec![0, 0, 1, 0]);
    }

    #[test]
    fn claimed_ids_are_returned_on_remove() {
        let mut registry = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        registry.insert(1, tx);

        registry.claim(1, &[10, 11, 12]);
        registry.release_ids(1, &[11]);
        registry.claim(7, &[99]);

        assert_eq!(registry.remove(1), Some(HashSet::from([10, 12])));
        assert_eq!(registry.remove(1), None);
        assert!(registry.is_empty());
    }
}
