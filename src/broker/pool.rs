//! Bounded worker pool that runs delivery tasks off the request path.

use std::io;
use std::thread;

use parking_lot::Mutex;
use tracing::{debug, error, warn};

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug)]
pub struct DeliveryPool {
    tx: Mutex<Option<flume::Sender<Job>>>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl DeliveryPool {
    /// Spawns `threads` workers sharing a job queue of `capacity` slots.
    pub fn new(threads: usize, capacity: usize) -> io::Result<Self> {
        let (tx, rx) = flume::bounded::<Job>(capacity.max(1));
        let mut workers = Vec::with_capacity(threads);

        for i in 0..threads.max(1) {
            let rx = rx.clone();
            let handle = thread::Builder::new()
                .name(format!("delivery-{i}"))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        job();
                    }
                    debug!(target: "relaymq::pool", worker = i, "Delivery worker exiting");
                })?;
            workers.push(handle);
        }

        Ok(Self {
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
        })
    }

    /// Queues a job, blocking the calling thread while the queue is full.
    /// Returns `false` once the pool has been shut down.
    pub fn submit<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let Some(tx) = self.tx.lock().clone() else {
            warn!(target: "relaymq::pool", "Delivery pool is shut down; dropping task");
            return false;
        };
        tx.send(Box::new(job)).is_ok()
    }

    /// Number of jobs waiting for a worker.
    pub fn queued(&self) -> usize {
        self.tx.lock().as_ref().map_or(0, |tx| tx.len())
    }

    /// Stops accepting jobs, lets workers drain the queue, and joins them.
    pub fn shutdown(&self) {
        drop(self.tx.lock().take());
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for handle in workers {
            if handle.join().is_err() {
                error!(target: "relaymq::pool", "Delivery worker panicked");
            }
        }
    }
}

impl Drop for DeliveryPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn runs_every_job_before_shutdown_returns() {
        let pool = DeliveryPool::new(3, 4).unwrap();
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let done = Arc::clone(&done);
            assert!(pool.submit(move || {
                done.fetch_add(1, Ordering::SeqCst);
            }));
        }
        pool.shutdown();
        assert_eq!(done.load(Ordering::SeqCst), 100);
        assert_eq!(pool.queued(), 0);
    }

    #[test]
    fn submit_after_shutdown_is_rejected() {
        let pool = DeliveryPool::new(1, 1).unwrap();
        pool.shutdown();
        assert!(!pool.submit(|| {}));
    }
}
