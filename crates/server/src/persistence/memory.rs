use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use super::DocStore;
use crate::error::PersistenceError;

#[derive(Debug, Default)]
struct Inner {
    docs: HashMap<String, Vec<u8>>,
    loads: HashMap<String, usize>,
    stores: HashMap<String, usize>,
}

/// In-process document store. Records how often each name was loaded and
/// stored so callers can observe persistence traffic.
#[derive(Debug, Default)]
pub struct MemoryDocStore {
    inner: Mutex<Inner>,
    closed: AtomicBool,
}

impl MemoryDocStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate `name` without counting it as a store call.
    pub fn insert(&self, name: &str, state: Vec<u8>) {
        self.lock().docs.insert(name.to_string(), state);
    }

    pub fn get(&self, name: &str) -> Option<Vec<u8>> {
        self.lock().docs.get(name).cloned()
    }

    pub fn load_count(&self, name: &str) -> usize {
        self.lock().loads.get(name).copied().unwrap_or(0)
    }

    pub fn store_count(&self, name: &str) -> usize {
        self.lock().stores.get(name).copied().unwrap_or(0)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl DocStore for MemoryDocStore {
    async fn load(&self, name: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
        if self.is_closed() {
            return Err(PersistenceError::Closed);
        }
        let mut inner = self.lock();
        *inner.loads.entry(name.to_string()).or_insert(0) += 1;
        Ok(inner.docs.get(name).cloned())
    }

    async fn store(&self, name: &str, state: &[u8]) -> Result<(), PersistenceError> {
        if self.is_closed() {
            return Err(PersistenceError::Closed);
        }
        let mut inner = self.lock();
        *inner.stores.entry(name.to_string()).or_insert(0) += 1;
        inner.docs.insert(name.to_string(), state.to_vec());
        Ok(())
    }

    async fn close(&self) -> Result<(), PersistenceError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
