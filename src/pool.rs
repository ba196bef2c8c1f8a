//! A minimal bounded worker pool used only for deferred eviction after
//! `set_max_size` shrinks the ceiling. One background thread is
//! sufficient; what matters is that the pending-job count is observable so
//! tests can assert on it.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::Sender;
use parking_lot::{Condvar, Mutex};

type Job = Box<dyn FnOnce() + Send + 'static>;

struct PoolState {
    pending: usize,
}

pub(crate) struct EvictionPool {
    sender: Option<Sender<Job>>,
    state: Arc<Mutex<PoolState>>,
    done: Arc<Condvar>,
    worker: Option<JoinHandle<()>>,
}

impl EvictionPool {
    pub(crate) fn new() -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded::<Job>();
        let worker = thread::Builder::new()
            .name("diskcache-evictor".to_string())
            .spawn(move || {
                for job in receiver {
                    job();
                }
            })
            .expect("failed to spawn eviction worker thread");
        EvictionPool {
            sender: Some(sender),
            state: Arc::new(Mutex::new(PoolState { pending: 0 })),
            done: Arc::new(Condvar::new()),
            worker: Some(worker),
        }
    }

    /// Enqueue `job` to run on the background thread. Returns immediately.
    pub(crate) fn submit<F: FnOnce() + Send + 'static>(&self, job: F) {
        self.state.lock().pending += 1;
        let state = self.state.clone();
        let done = self.done.clone();
        let wrapped: Job = Box::new(move || {
            job();
            let mut st = state.lock();
            st.pending -= 1;
            if st.pending == 0 {
                done.notify_all();
            }
        });
        if let Some(sender) = &self.sender {
            // The pool is only ever dropped from `close`, which happens
            // after the sender handle the caller holds is gone, so this
            // should never actually disconnect in practice.
            let _ = sender.send(wrapped);
        }
    }

    /// Number of jobs submitted but not yet finished running.
    pub(crate) fn pending_count(&self) -> usize {
        self.state.lock().pending
    }

    /// Block until every submitted job has finished.
    pub(crate) fn flush(&self) {
        let mut st = self.state.lock();
        while st.pending > 0 {
            self.done.wait(&mut st);
        }
    }
}

impl Drop for EvictionPool {
    fn drop(&mut self) {
        // Dropping the sender closes the channel, so the worker's `for job
        // in receiver` loop ends once it's drained whatever was queued.
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
