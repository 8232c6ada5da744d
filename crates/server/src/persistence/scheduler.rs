use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};

use super::debounce::SaveDebouncer;

/// Something the scheduler saves once a burst of mutations settles.
#[async_trait]
pub trait ScheduledSave: Send + Sync + 'static {
    async fn scheduled_save(&self);
}

struct Shared {
    debouncer: Mutex<SaveDebouncer>,
    wake: Notify,
    cancelled: AtomicBool,
}

impl Shared {
    fn debouncer(&self) -> MutexGuard<'_, SaveDebouncer> {
        self.debouncer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Debounced save timer for one session.
///
/// The timer task only holds a weak reference to its target, so a session
/// that is dropped without being drained does not keep itself alive.
pub struct PersistenceScheduler {
    shared: Arc<Shared>,
}

impl PersistenceScheduler {
    pub fn new(quiet: Duration, max_wait: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                debouncer: Mutex::new(SaveDebouncer::new(quiet, max_wait)),
                wake: Notify::new(),
                cancelled: AtomicBool::new(false),
            }),
        }
    }

    /// Spawn the timer task. Must be called from within a tokio runtime.
    pub fn start<T: ScheduledSave>(&self, target: Weak<T>) {
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            run_timer(shared, target).await;
        });
    }

    /// Record a mutation; a save becomes due per the debounce window.
    pub fn kick(&self) {
        if self.shared.cancelled.load(Ordering::SeqCst) {
            return;
        }
        self.shared.debouncer().kick();
        self.shared.wake.notify_one();
    }

    /// Drop any pending save without running it. Used before a flush so the
    /// timer cannot fire a second save afterwards.
    pub fn clear_pending(&self) {
        self.shared.debouncer().cancel();
        self.shared.wake.notify_one();
    }

    pub fn is_pending(&self) -> bool {
        self.shared.debouncer().is_pending()
    }

    /// Stop the timer for good. Idempotent.
    pub fn cancel(&self) {
        if self.shared.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.debouncer().cancel();
        self.shared.wake.notify_one();
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::SeqCst)
    }
}

impl Drop for PersistenceScheduler {
    fn drop(&mut self) {
        self.cancel();
    }
}

async fn run_timer<T: ScheduledSave>(shared: Arc<Shared>, target: Weak<T>) {
    loop {
        if shared.cancelled.load(Ordering::SeqCst) {
            return;
        }

        let deadline = shared.debouncer().next_deadline();
        let Some(deadline) = deadline else {
            shared.wake.notified().await;
            continue;
        };

        tokio::select! {
            _ = shared.wake.notified() => continue,
            _ = sleep_until(deadline) => {}
        }

        let due = shared.debouncer().take_due_at(Instant::now());
        if !due || shared.cancelled.load(Ordering::SeqCst) {
            continue;
        }
        let Some(target) = target.upgrade() else {
            return;
        };
        target.scheduled_save().await;
    }
}
