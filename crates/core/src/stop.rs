//! Per-`OpenFile` and global cancellation, grounded on `librqbit_core`'s
//! `ThreadCancelEvent` (`watch.rs`): a boxed bool behind a mutex/condvar so a
//! blocking reader can wait on it directly instead of polling.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

pub struct StopFlag {
    stopped: Mutex<bool>,
    cond: Condvar,
}

impl Default for StopFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl StopFlag {
    pub fn new() -> Self {
        Self {
            stopped: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    pub fn stop(&self) {
        let mut stopped = self.stopped.lock();
        *stopped = true;
        self.cond.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        *self.stopped.lock()
    }

    /// Blocks until stopped or `timeout` elapses; returns whether stopped.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut stopped = self.stopped.lock();
        if *stopped {
            return true;
        }
        self.cond.wait_for(&mut stopped, timeout);
        *stopped
    }
}
