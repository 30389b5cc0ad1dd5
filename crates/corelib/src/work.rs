//! Named fixed-size pools for blocking work.
//!
//! Socket readiness lives on the async runtime; anything that may block
//! (disk I/O, per-oid mutexes, deletion sweeps) runs on one of these pools.
//! A queued item resolves the returned oneshot when its closure finishes,
//! which resumes the awaiting task back on the runtime; that channel is the
//! only edge between workers and the rest of the system.

use crossbeam::channel;
use tokio::sync::oneshot;

use crate::error::{Error, Result};

type Job = Box<dyn FnOnce(usize) + Send + 'static>;

pub struct WorkQueue {
    name: &'static str,
    tx: Option<channel::Sender<Job>>,
    workers: Vec<std::thread::JoinHandle<()>>,
}

impl WorkQueue {
    /// Spawn `nr_threads` workers draining a shared FIFO.
    pub fn new(name: &'static str, nr_threads: usize) -> Self {
        let (tx, rx) = channel::unbounded::<Job>();
        let workers = (0..nr_threads)
            .map(|idx| {
                let rx = rx.clone();
                std::thread::Builder::new()
                    .name(format!("{name}-{idx}"))
                    .spawn(move || {
                        tracing::debug!(queue = name, idx, "worker started");
                        for job in rx.iter() {
                            job(idx);
                        }
                        tracing::debug!(queue = name, idx, "worker stopped");
                    })
                    .expect("failed to spawn worker thread")
            })
            .collect();
        Self {
            name,
            tx: Some(tx),
            workers,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Hand a blocking closure to the pool. The receiver resolves with the
    /// closure's value once a worker has run it; dropping the receiver
    /// orphans the item (it still runs, the result is discarded).
    pub fn queue<F, T>(&self, f: F) -> oneshot::Receiver<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        let job: Job = Box::new(move |_idx| {
            let _ = done_tx.send(f());
        });
        if let Some(tx) = &self.tx {
            let _ = tx.send(job);
        }
        done_rx
    }

    /// Queue `f` and await its completion.
    pub async fn run<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.queue(f).await.map_err(|_| Error::Shutdown)
    }

    /// Stop accepting work and join the workers after their current item.
    pub fn shutdown(&mut self) {
        self.tx.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// The daemon's named queues.
pub struct WorkQueues {
    /// Gateway fan-out bodies that must block.
    pub gateway: WorkQueue,
    /// Local disk ops.
    pub io: WorkQueue,
    /// Epoch-transition rebuild.
    pub recovery: WorkQueue,
    /// VDI deletion sweeps, serialized.
    pub deletion: WorkQueue,
    /// Serialized blocking follow-ups from the cluster state machine.
    pub block: WorkQueue,
}

impl WorkQueues {
    pub fn start() -> Self {
        Self {
            gateway: WorkQueue::new("gway", 8),
            io: WorkQueue::new("io", 4),
            recovery: WorkQueue::new("rw", 2),
            deletion: WorkQueue::new("deletion", 1),
            block: WorkQueue::new("block", 1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_queue_runs_and_completes() {
        let wq = WorkQueue::new("test", 2);
        let value = wq.run(|| 40 + 2).await.unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn test_all_items_run() {
        let wq = WorkQueue::new("test", 3);
        let counter = Arc::new(AtomicUsize::new(0));
        let mut pending = Vec::new();
        for _ in 0..32 {
            let counter = counter.clone();
            pending.push(wq.queue(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }
        for rx in pending {
            rx.await.unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 32);
    }

    #[test]
    fn test_shutdown_joins_workers() {
        let mut wq = WorkQueue::new("test", 2);
        let rx = wq.queue(|| 7);
        wq.shutdown();
        assert_eq!(rx.blocking_recv().unwrap(), 7);
    }
}
