//! Trailing-edge throttle for routine invalidations.

use std::time::Duration;

use tokio::time::Instant;

/// Collapses every signal inside one window into a single trailing action.
///
/// The first signal arms a deadline `window` from now; later signals before the
/// deadline only add to the coalesced count. The owner sleeps until
/// [`deadline`](Self::deadline) and then calls [`fire`](Self::fire).
#[derive(Debug)]
pub struct Throttle {
    window: Duration,
    deadline: Option<Instant>,
    pending: u32,
}

impl Throttle {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            deadline: None,
            pending: 0,
        }
    }

    /// Records a signal. Returns true if it armed a new window.
    pub fn signal(&mut self, now: Instant) -> bool {
        self.pending += 1;
        if self.deadline.is_some() {
            return false;
        }
        self.deadline = Some(now + self.window);
        true
    }

    /// When the trailing action is due, if a window is open.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Closes the window and returns how many signals it absorbed.
    pub fn fire(&mut self) -> u32 {
        self.deadline = None;
        std::mem::take(&mut self.pending)
    }
}
