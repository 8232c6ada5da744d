// Save debouncer for live document sessions.
//
// A save becomes due `quiet` after the most recent kick, but never later than
// `max_wait` after the first kick of the current burst.

use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct SaveDebouncer {
    quiet: Duration,
    max_wait: Duration,
    first_kick: Option<Instant>,
    last_kick: Option<Instant>,
}

impl SaveDebouncer {
    pub fn new(quiet: Duration, max_wait: Duration) -> Self {
        Self { quiet, max_wait, first_kick: None, last_kick: None }
    }

    /// Record a mutation.
    pub fn kick(&mut self) {
        self.kick_at(Instant::now());
    }

    /// Like `kick` but with a specific timestamp (for testing).
    pub fn kick_at(&mut self, now: Instant) {
        self.first_kick.get_or_insert(now);
        self.last_kick = Some(now);
    }

    /// When the pending save fires, or None if nothing is pending.
    pub fn next_deadline(&self) -> Option<Instant> {
        let first = self.first_kick?;
        let last = self.last_kick?;
        Some((last + self.quiet).min(first + self.max_wait))
    }

    /// Clears the pending burst and returns true if its deadline has passed.
    pub fn take_due_at(&mut self, now: Instant) -> bool {
        match self.next_deadline() {
            Some(deadline) if deadline <= now => {
                self.cancel();
                true
            }
            _ => false,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.first_kick.is_some()
    }

    pub fn cancel(&mut self) {
        self.first_kick = None;
        self.last_kick = None;
    }
}
