//! Serialized I/O submission queue.
//!
//! Grounded on `open_file_base.hpp`'s `io_item`: a submitted closure plus a
//! one-shot result. One queue and one worker thread per full-file
//! `OpenFile` guarantees reads/writes/truncates observe submission order, as
//! required by §5's ordering guarantee.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::error::Result;
use crate::stop::StopFlag;

pub enum IoOutcome {
    Read(Vec<u8>),
    Written(usize),
    Resized,
}

type IoAction = Box<dyn FnOnce() -> Result<IoOutcome> + Send>;

struct IoItem {
    action: Mutex<Option<IoAction>>,
    result: Mutex<Option<Result<IoOutcome>>>,
    cond: Condvar,
}

pub struct IoQueue {
    queue: Mutex<VecDeque<Arc<IoItem>>>,
    cond: Condvar,
    stop: Arc<StopFlag>,
}

impl IoQueue {
    pub fn new(stop: Arc<StopFlag>) -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
            stop,
        })
    }

    /// Spawns the single worker thread servicing this queue. The returned
    /// handle is joined by the `OpenFile` on close, after `stop` is set.
    pub fn spawn_worker(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        std::thread::Builder::new()
            .name("openfile-io".into())
            .spawn(move || this.worker_loop())
            .expect("spawn io worker thread")
    }

    fn worker_loop(&self) {
        loop {
            let item = {
                let mut queue = self.queue.lock();
                loop {
                    if let Some(item) = queue.pop_front() {
                        break Some(item);
                    }
                    if self.stop.is_stopped() {
                        break None;
                    }
                    self.cond.wait_for(&mut queue, Duration::from_millis(250));
                }
            };
            let Some(item) = item else {
                if self.stop.is_stopped() {
                    return;
                }
                continue;
            };
            let action = item.action.lock().take();
            let outcome = match action {
                Some(action) => action(),
                None => continue,
            };
            let mut result = item.result.lock();
            *result = Some(outcome);
            item.cond.notify_all();
        }
    }

    /// Blocks the caller until `action` has run on the worker thread and
    /// returns its outcome.
    pub fn submit(&self, action: IoAction) -> Result<IoOutcome> {
        let item = Arc::new(IoItem {
            action: Mutex::new(Some(action)),
            result: Mutex::new(None),
            cond: Condvar::new(),
        });
        self.queue.lock().push_back(item.clone());
        self.cond.notify_one();

        let mut result = item.result.lock();
        loop {
            if let Some(r) = result.take() {
                return r;
            }
            item.cond.wait(&mut result);
        }
    }

    pub fn wake(&self) {
        self.cond.notify_all();
    }
}
