pub mod awareness;
pub mod defaults;
pub mod replica;

pub use awareness::{AwarenessChange, AwarenessStore};
pub use replica::{Replica, SyncOutcome};
