//! C1: process-wide cache byte budget.
//!
//! Shape follows `librqbit_core`'s `ThreadCancelEvent` (`watch.rs`): a
//! `parking_lot::Mutex` + `Condvar` pair, blocking waits woken by every
//! mutation plus an explicit stop. The 5-second poll mirrors the original
//! `cache_size_mgr`'s `cache_wait_secs`.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::error::{DataPlaneError, Result};

const DEFAULT_POLL: Duration = Duration::from_secs(5);

struct State {
    current: u64,
    max: u64,
    stopped: bool,
}

/// A process-wide singleton in production; tests construct one per case.
pub struct CacheGovernor {
    state: Mutex<State>,
    cond: Condvar,
    poll: Duration,
}

impl CacheGovernor {
    pub fn new(max: u64) -> Self {
        Self::with_poll(max, DEFAULT_POLL)
    }

    pub fn with_poll(max: u64, poll: Duration) -> Self {
        Self {
            state: Mutex::new(State {
                current: 0,
                max,
                stopped: false,
            }),
            cond: Condvar::new(),
            poll,
        }
    }

    /// Blocks until `n` bytes are reserved or `stop()` is called.
    #[tracing::instrument(skip(self), fields(n))]
    pub fn expand(&self, n: u64) -> Result<()> {
        let mut state = self.state.lock();
        loop {
            if state.stopped {
                return Err(DataPlaneError::Cancelled);
            }
            if state.current + n <= state.max {
                state.current += n;
                tracing::trace!(current = state.current, max = state.max, "cache expanded");
                return Ok(());
            }
            tracing::debug!(
                current = state.current,
                max = state.max,
                requested = n,
                "cache full, waiting for space"
            );
            self.cond.wait_for(&mut state, self.poll);
        }
    }

    /// Releases `min(n, current)` bytes and wakes every waiter.
    pub fn shrink(&self, n: u64) {
        let mut state = self.state.lock();
        let released = n.min(state.current);
        state.current -= released;
        tracing::trace!(current = state.current, released, "cache shrunk");
        self.cond.notify_all();
    }

    pub fn size(&self) -> u64 {
        self.state.lock().current
    }

    pub fn max(&self) -> u64 {
        self.state.lock().max
    }

    pub fn set_max(&self, max: u64) {
        let mut state = self.state.lock();
        state.max = max;
        self.cond.notify_all();
    }

    pub fn stop(&self) {
        let mut state = self.state.lock();
        state.stopped = true;
        self.cond.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }
}
