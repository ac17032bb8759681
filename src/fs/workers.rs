//! Worker threads for kernel requests
//!
//! The FUSE session reads requests on one thread. Requests that touch the
//! metadata store or the disk are queued here so a slow release or a
//! retrying commit does not stall lookups behind it.

use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread::JoinHandle;
use tracing::{debug, error, warn};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed set of threads draining one job queue
pub struct WorkerPool {
    tx: Option<flume::Sender<Job>>,
    threads: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(size: usize) -> io::Result<Self> {
        let (tx, rx) = flume::unbounded::<Job>();
        let mut threads = Vec::with_capacity(size);
        for n in 0..size.max(1) {
            let rx = rx.clone();
            let thread = std::thread::Builder::new()
                .name(format!("bridgefs-worker-{}", n))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        if catch_unwind(AssertUnwindSafe(job)).is_err() {
                            error!("request handler panicked");
                        }
                    }
                    debug!("worker exiting");
                })?;
            threads.push(thread);
        }
        Ok(WorkerPool {
            tx: Some(tx),
            threads,
        })
    }

    pub fn size(&self) -> usize {
        self.threads.len()
    }

    /// Queue `job`; runs it on the caller's thread if the pool is gone
    pub fn execute<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let job: Job = Box::new(job);
        let job = match &self.tx {
            Some(tx) => match tx.send(job) {
                Ok(()) => return,
                Err(flume::SendError(job)) => job,
            },
            None => job,
        };
        warn!("worker pool closed, running request inline");
        job();
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // closing the queue lets every worker finish what is queued and exit
        self.tx.take();
        for thread in self.threads.drain(..) {
            if thread.join().is_err() {
                error!("worker thread panicked");
            }
        }
    }
}
