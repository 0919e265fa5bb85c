//! Fixed-size worker pools.
//!
//! The replication core runs five named pools, one per replication phase.
//! A pool is a bounded set of threads draining one shared task queue;
//! stopping a pool drains in-flight tasks and joins every worker before
//! returning, so worker threads are never destroyed mid-execution.

use crate::error::ReplResult;
use parking_lot::Mutex;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::thread::{Builder, JoinHandle};
use tracing::{info, warn};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A fixed-size pool of worker threads draining one task queue.
pub struct WorkerPool {
    name: String,
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Starts a pool of `size` workers named `<name>-<idx>`.
    pub fn new(name: impl Into<String>, size: usize) -> ReplResult<Self> {
        let name = name.into();
        let (sender, receiver) = channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));

        let mut workers = Vec::with_capacity(size);
        for idx in 0..size {
            let receiver = Arc::clone(&receiver);
            let handle = Builder::new()
                .name(format!("{name}-{idx}"))
                .spawn(move || worker_loop(&receiver))?;
            workers.push(handle);
        }

        info!("worker pool {name} started with {size} workers");
        Ok(Self {
            name,
            sender: Some(sender),
            workers,
        })
    }

    /// The pool's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of workers.
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Enqueues a task. Scheduling onto a stopped pool is a logged no-op.
    pub fn schedule(&self, job: impl FnOnce() + Send + 'static) {
        match &self.sender {
            Some(sender) => {
                if sender.send(Box::new(job)).is_err() {
                    warn!("pool {} rejected task: workers gone", self.name);
                }
            }
            None => warn!("pool {} rejected task: stopped", self.name),
        }
    }

    /// Stops the pool: closes the queue, lets workers drain what is already
    /// enqueued, and joins every worker thread.
    pub fn stop(&mut self) {
        self.sender.take();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                warn!("pool {} worker panicked", self.name);
            }
        }
        info!("worker pool {} stopped", self.name);
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if self.sender.is_some() || !self.workers.is_empty() {
            self.stop();
        }
    }
}

fn worker_loop(receiver: &Mutex<Receiver<Job>>) {
    loop {
        let job = receiver.lock().recv();
        match job {
            Ok(job) => job(),
            Err(_) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn runs_scheduled_tasks() {
        let mut pool = WorkerPool::new("test", 2).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..16 {
            let counter = Arc::clone(&counter);
            pool.schedule(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.stop();
        assert_eq!(counter.load(Ordering::SeqCst), 16);
    }

    #[test]
    fn stop_drains_in_flight_tasks() {
        let mut pool = WorkerPool::new("drain", 1).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            let counter = Arc::clone(&counter);
            pool.schedule(move || {
                std::thread::sleep(Duration::from_millis(10));
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.stop();
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn schedule_after_stop_is_noop() {
        let mut pool = WorkerPool::new("late", 1).unwrap();
        pool.stop();
        pool.schedule(|| panic!("must not run"));
        assert_eq!(pool.size(), 0);
    }

    #[test]
    fn pool_metadata() {
        let mut pool = WorkerPool::new("meta", 3).unwrap();
        assert_eq!(pool.name(), "meta");
        assert_eq!(pool.size(), 3);
        pool.stop();
    }
}
