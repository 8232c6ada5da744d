//! Durable storage of encoded document state, plus the debounced scheduling
//! of saves for live sessions.

pub mod debounce;
pub mod memory;
pub mod scheduler;
pub mod sqlite;

use async_trait::async_trait;

use crate::error::PersistenceError;

pub use memory::MemoryDocStore;
pub use scheduler::PersistenceScheduler;
pub use sqlite::SqliteDocStore;

/// Persistence gateway keyed by document name.
///
/// `load` returns `None` for a name that was never stored. `store` replaces
/// whatever was stored before (last write wins).
#[async_trait]
pub trait DocStore: Send + Sync {
    async fn load(&self, name: &str) -> Result<Option<Vec<u8>>, PersistenceError>;

    async fn store(&self, name: &str, state: &[u8]) -> Result<(), PersistenceError>;

    async fn close(&self) -> Result<(), PersistenceError> {
        Ok(())
    }
}
