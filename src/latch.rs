//! A sticky, broadcast-wake blocking latch.
//!
//! [Latch] is the bridge between the scheduler thread and ordinary blocking
//! threads: one or more threads park on it, and whichever thread completes
//! the associated node opens it, releasing every waiter at once. Once opened
//! a latch stays open, so a waiter that arrives after the completion returns
//! immediately rather than sleeping forever.
//!
//! # Example
//!
//! ```
//! use deferred::latch::Latch;
//! use std::sync::Arc;
//! use std::thread;
//!
//! let latch = Arc::new(Latch::new());
//! let l2 = latch.clone();
//!
//! let waiter = thread::spawn(move || l2.wait());
//! latch.open();
//! waiter.join().unwrap();
//! ```

use std::{
    sync::{Condvar, Mutex},
    time::{Duration, Instant},
};

/// A one-shot gate that blocks callers until it is opened.
///
/// Opening is idempotent and wakes *all* waiters (broadcast, not single
/// wake). The open state is sticky: there is no window in which a completion
/// racing a new waiter can strand that waiter.
#[derive(Default)]
pub struct Latch {
    opened: Mutex<bool>,
    cond: Condvar,
}

impl Latch {
    /// Create a closed latch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Park the calling thread until the latch is opened. Returns
    /// immediately if it already is.
    pub fn wait(&self) {
        let mut opened = self.opened.lock().unwrap();
        while !*opened {
            opened = self.cond.wait(opened).unwrap();
        }
    }

    /// Park the calling thread until the latch is opened or `timeout` has
    /// elapsed. Returns whether the latch is open.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut opened = self.opened.lock().unwrap();

        while !*opened {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }

            let (guard, _) = self.cond.wait_timeout(opened, deadline - now).unwrap();
            opened = guard;
        }

        true
    }

    /// Open the latch, releasing every current and future waiter.
    pub fn open(&self) {
        *self.opened.lock().unwrap() = true;
        self.cond.notify_all();
    }

    /// Whether the latch has been opened.
    pub fn is_open(&self) -> bool {
        *self.opened.lock().unwrap()
    }
}
