//! Shared worker pool for asynchronous dispatch passes.
//!
//! A fixed set of named OS threads drains a bounded `flume` channel of jobs.
//! Submission never blocks: when the channel is full or the pool has been
//! shut down the job is handed back to the caller.

use flume::{Receiver, Sender, TrySendError};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error};

use crate::config::CONFIG;

pub type Job = Box<dyn FnOnce() + Send + 'static>;

static GLOBAL_POOL: Lazy<Arc<DeliveryPool>> = Lazy::new(|| {
    let cfg = &CONFIG.delivery;
    match DeliveryPool::new(cfg.workers, cfg.task_capacity) {
        Ok(pool) => Arc::new(pool),
        Err(e) => {
            error!(target: "blipq::pool", error = %e, "failed to start delivery workers; dispatching inline");
            Arc::new(DeliveryPool::inline())
        }
    }
});

#[derive(Debug)]
pub struct DeliveryPool {
    sender: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl DeliveryPool {
    /// Starts `workers` threads sharing a job queue of `capacity` slots.
    /// Zero workers gives an inline pool.
    pub fn new(workers: usize, capacity: usize) -> io::Result<Self> {
        if workers == 0 {
            return Ok(Self::inline());
        }
        let (tx, rx) = flume::bounded::<Job>(capacity.max(1));
        let mut handles = Vec::with_capacity(workers);
        for i in 0..workers {
            let rx = rx.clone();
            let handle = thread::Builder::new()
                .name(format!("blipq-delivery-{i}"))
                .spawn(move || worker_loop(i, rx))?;
            handles.push(handle);
        }
        debug!(target: "blipq::pool", workers, capacity, "delivery pool started");
        Ok(Self {
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(handles),
        })
    }

    /// A pool without workers: every submission is handed back, so callers
    /// run the job on their own thread.
    pub fn inline() -> Self {
        Self {
            sender: Mutex::new(None),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Process-wide pool sized from [`CONFIG`].
    pub fn global() -> Arc<DeliveryPool> {
        Arc::clone(&GLOBAL_POOL)
    }

    pub fn worker_count(&self) -> usize {
        self.workers.lock().len()
    }

    /// Queues `job`. Returns it if the pool is saturated or stopped.
    pub fn submit(&self, job: Job) -> Result<(), Job> {
        let guard = self.sender.lock();
        match guard.as_ref() {
            Some(tx) => tx.try_send(job).map_err(|e| match e {
                TrySendError::Full(job) | TrySendError::Disconnected(job) => job,
            }),
            None => Err(job),
        }
    }

    /// Stops accepting jobs, lets queued ones finish and joins the workers.
    pub fn shutdown(&self) {
        self.sender.lock().take();
        let handles = std::mem::take(&mut *self.workers.lock());
        let current = thread::current().id();
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                error!(target: "blipq::pool", "delivery worker panicked");
            }
        }
    }
}

impl Drop for DeliveryPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(id: usize, rx: Receiver<Job>) {
    while let Ok(job) = rx.recv() {
        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
            error!(target: "blipq::pool", worker = id, "dispatch job panicked");
        }
    }
    debug!(target: "blipq::pool", worker = id, "delivery worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn jobs_run_on_workers() {
        let pool = DeliveryPool::new(2, 16).unwrap();
        assert_eq!(pool.worker_count(), 2);
        let (tx, rx) = flume::unbounded();
        for i in 0..8 {
            let tx = tx.clone();
            pool.submit(Box::new(move || {
                let name = thread::current().name().map(str::to_owned);
                tx.send((i, name)).unwrap();
            }))
            .unwrap_or_else(|_| panic!("pool rejected job"));
        }
        for _ in 0..8 {
            let (_, name) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            assert!(name.unwrap().starts_with("blipq-delivery-"));
        }
    }

    #[test]
    fn inline_pool_hands_jobs_back() {
        let pool = DeliveryPool::inline();
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);
        let job = pool
            .submit(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap_err();
        job();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn shutdown_rejects_new_jobs() {
        let pool = DeliveryPool::new(1, 4).unwrap();
        pool.shutdown();
        assert!(pool.submit(Box::new(|| {})).is_err());
        assert_eq!(pool.worker_count(), 0);
    }

    #[test]
    fn panicking_job_does_not_kill_worker() {
        let pool = DeliveryPool::new(1, 4).unwrap();
        let _ = pool.submit(Box::new(|| panic!("boom")));
        let (tx, rx) = flume::bounded(1);
        pool.submit(Box::new(move || tx.send(()).unwrap()))
            .unwrap_or_else(|_| panic!("pool rejected job"));
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
    }
}
