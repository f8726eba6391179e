//! Fixed worker pool executing connection read/write steps.
//!
//! One shared MPMC queue feeds every worker. Tasks are bounded units (a
//! single socket drain or flush); per-connection ordering comes from the
//! connection's own step mutex, not from the pool.

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Sender};
use tracing::{debug, error, warn};

type Task = Box<dyn FnOnce() + Send + 'static>;

pub struct WorkerExecutor {
    sender: Option<Sender<Task>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerExecutor {
    /// Spawn `threads` workers sharing one task queue.
    pub fn new(threads: usize) -> io::Result<Self> {
        let (sender, receiver) = unbounded::<Task>();
        let mut workers = Vec::with_capacity(threads);

        for id in 0..threads {
            let receiver = receiver.clone();
            let handle = thread::Builder::new()
                .name(format!("worker-{id}"))
                .spawn(move || {
                    while let Ok(task) = receiver.recv() {
                        if panic::catch_unwind(AssertUnwindSafe(|| task())).is_err() {
                            error!(worker = id, "task panicked");
                        }
                    }
                    debug!(worker = id, "worker exiting");
                })?;
            workers.push(handle);
        }

        Ok(Self {
            sender: Some(sender),
            workers,
        })
    }

    /// Queue a task for the next idle worker.
    pub fn submit<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        match &self.sender {
            Some(sender) => {
                if sender.send(Box::new(task)).is_err() {
                    warn!("executor stopped, task dropped");
                }
            }
            None => warn!("executor stopped, task dropped"),
        }
    }

    /// Number of worker threads.
    pub fn thread_count(&self) -> usize {
        self.workers.len()
    }

    /// Close the queue, let workers drain the remaining tasks, and join
    /// them. Idempotent.
    pub fn stop(&mut self) {
        if let Some(sender) = self.sender.take() {
            drop(sender);
            for handle in self.workers.drain(..) {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for WorkerExecutor {
    fn drop(&mut self) {
        self.stop();
    }
}
