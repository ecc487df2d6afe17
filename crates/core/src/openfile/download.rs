//! At-most-one-in-flight-per-key download coalescing.
//!
//! Grounded on `open_file_base.hpp`'s `download` inner class: a condvar plus
//! a one-shot result slot, reproduced here as the target language's native
//! primitive per the Design Notes guidance to replace "coroutine-like promise
//! objects" with ordinary blocking sync.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::error::Result;

struct Slot {
    done: Mutex<Option<Result<()>>>,
    cond: Condvar,
}

/// Keyed by chunk index (or ring slot). One [`Coordinator`] per `OpenFile`.
pub struct Coordinator {
    inflight: Mutex<HashMap<u64, Arc<Slot>>>,
}

impl Default for Coordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl Coordinator {
    pub fn new() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// If a download for `key` is already in flight, blocks for its result.
    /// Otherwise runs `start` on the calling thread and publishes the result
    /// to anyone who joined while it ran.
    pub fn run_or_wait(&self, key: u64, start: impl FnOnce() -> Result<()>) -> Result<()> {
        let joined = {
            let mut inflight = self.inflight.lock();
            if let Some(existing) = inflight.get(&key) {
                Some(existing.clone())
            } else {
                inflight.insert(
                    key,
                    Arc::new(Slot {
                        done: Mutex::new(None),
                        cond: Condvar::new(),
                    }),
                );
                None
            }
        };

        if let Some(slot) = joined {
            let mut done = slot.done.lock();
            loop {
                if let Some(result) = done.clone() {
                    return result;
                }
                slot.cond.wait(&mut done);
            }
        }

        let result = start();

        let slot = self.inflight.lock().remove(&key);
        if let Some(slot) = slot {
            let mut done = slot.done.lock();
            *done = Some(result.clone());
            slot.cond.notify_all();
        }
        result
    }

    pub fn is_in_flight(&self, key: u64) -> bool {
        self.inflight.lock().contains_key(&key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DataPlaneError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::time::Duration;

    #[test]
    fn second_caller_joins_first_and_gets_same_result() {
        let coord = Arc::new(Coordinator::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(2));

        let c2 = coord.clone();
        let calls2 = calls.clone();
        let barrier2 = barrier.clone();
        let handle = std::thread::spawn(move || {
            c2.run_or_wait(1, || {
                calls2.fetch_add(1, Ordering::SeqCst);
                barrier2.wait();
                std::thread::sleep(Duration::from_millis(50));
                Ok(())
            })
        });

        barrier.wait();
        let joined = coord.run_or_wait(1, || {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        assert!(joined.is_ok());
        assert!(handle.join().unwrap().is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failed_download_propagates_to_joiners() {
        let coord = Coordinator::new();
        let result = coord.run_or_wait(1, || Err(DataPlaneError::CommError("boom".into())));
        assert!(matches!(result, Err(DataPlaneError::CommError(_))));
        assert!(!coord.is_in_flight(1));
    }
}
