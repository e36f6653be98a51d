//! Dedicated worker thread for the root context
//!
//! Work is handed over a channel and the caller blocks on a one-shot reply.
//! Work submitted from the worker thread itself runs inline.

use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, ThreadId};
use crossbeam::channel::{Sender, bounded, unbounded};
use crate::{Error, Result};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Single thread executing jobs in submission order.
#[derive(Debug)]
pub struct RootWorker {
    tx: Sender<Job>,
    thread: ThreadId,
}

impl RootWorker {
    /// Spawn the worker thread. It exits once the worker is dropped and the
    /// queue drains.
    pub fn spawn(name: &str) -> Result<Self> {
        let (tx, rx) = unbounded::<Job>();
        let thread_name = format!("ctxstore-{}", name);

        let handle = thread::Builder::new().name(thread_name.clone()).spawn(move || {
            for job in rx {
                if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                    tracing::error!("Job on {} panicked", thread_name);
                }
            }
            tracing::debug!("{} stopped", thread_name);
        })?;

        Ok(Self {
            tx,
            thread: handle.thread().id(),
        })
    }

    pub fn thread_id(&self) -> ThreadId {
        self.thread
    }

    pub fn is_current(&self) -> bool {
        thread::current().id() == self.thread
    }

    /// Run `job` on the worker and wait for its result
    pub fn run<F, R>(&self, owner: &str, job: F) -> Result<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.is_current() {
            return Ok(job());
        }

        let (reply_tx, reply_rx) = bounded::<R>(1);
        self.tx
            .send(Box::new(move || {
                let _ = reply_tx.send(job());
            }))
            .map_err(|_| Error::WorkerUnavailable(owner.to_string()))?;

        // A panicking job drops its reply sender without sending
        reply_rx.recv().map_err(|_| Error::WorkerUnavailable(owner.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_runs_on_worker_thread() {
        let worker = RootWorker::spawn("test").unwrap();
        let on_worker = worker.run("test", || thread::current().name().map(str::to_string)).unwrap();
        assert_eq!(on_worker.as_deref(), Some("ctxstore-test"));
        assert_ne!(thread::current().id(), worker.thread_id());
    }

    #[test]
    fn test_jobs_are_serialized() {
        let worker = Arc::new(RootWorker::spawn("serial").unwrap());
        let counter = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let worker = Arc::clone(&worker);
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    worker
                        .run("serial", move || {
                            // Non-atomic read-modify-write is safe only if jobs never interleave
                            let seen = counter.load(Ordering::SeqCst);
                            thread::yield_now();
                            counter.store(seen + 1, Ordering::SeqCst);
                        })
                        .unwrap();
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn test_panicking_job_reports_unavailable_and_worker_survives() {
        let worker = RootWorker::spawn("panics").unwrap();
        let result: Result<()> = worker.run("panics", || panic!("boom"));
        assert!(matches!(result, Err(Error::WorkerUnavailable(_))));
        assert_eq!(worker.run("panics", || 41 + 1).unwrap(), 42);
    }
}
