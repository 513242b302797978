//! Bounded worker pool for FUSE requests.
//!
//! Backend calls block for a network round trip, sometimes many. Running
//! them on the fuser session thread would stall every other request, so each
//! request is handed to a fixed set of worker threads through a bounded
//! queue.
//!
//! When the queue stays full for longer than the configured wait, the task is
//! run inline with [`Admission::Busy`] so it can reply `ETIMEDOUT` instead
//! of piling up.

use crossbeam_channel::{Receiver, SendTimeoutError, Sender, bounded};
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Whether a task got a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Running on a worker thread.
    Run,
    /// Rejected after the queue stayed full; running inline on the caller.
    Busy,
}

type BoxedTask = Box<dyn FnOnce(Admission) + Send + 'static>;

#[derive(Debug, Default)]
pub struct WorkerStats {
    submitted: AtomicU64,
    rejected: AtomicU64,
    panicked: AtomicU64,
}

impl WorkerStats {
    pub fn submitted_count(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    pub fn rejected_count(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn panicked_count(&self) -> u64 {
        self.panicked.load(Ordering::Relaxed)
    }
}

pub struct WorkerPool {
    sender: Option<Sender<BoxedTask>>,
    workers: Vec<JoinHandle<()>>,
    queue_wait: Duration,
    stats: Arc<WorkerStats>,
}

impl WorkerPool {
    /// Starts `num_workers` threads with a queue of twice that depth.
    pub fn new(num_workers: usize, queue_wait: Duration) -> io::Result<Self> {
        let num_workers = num_workers.max(1);
        let (sender, receiver) = bounded::<BoxedTask>(num_workers * 2);
        let stats = Arc::new(WorkerStats::default());

        let mut workers = Vec::with_capacity(num_workers);
        for i in 0..num_workers {
            let receiver = receiver.clone();
            let stats = Arc::clone(&stats);
            let handle = thread::Builder::new()
                .name(format!("rdrive-io-{i}"))
                .spawn(move || worker_loop(&receiver, &stats))?;
            workers.push(handle);
        }
        debug!(num_workers, queue_wait_ms = queue_wait.as_millis() as u64, "Worker pool started");

        Ok(Self {
            sender: Some(sender),
            workers,
            queue_wait,
            stats,
        })
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Queues `task`, waiting up to the queue wait for a free slot.
    pub fn submit<F>(&self, task: F)
    where
        F: FnOnce(Admission) + Send + 'static,
    {
        self.stats.submitted.fetch_add(1, Ordering::Relaxed);
        let task: BoxedTask = Box::new(task);
        let Some(sender) = &self.sender else {
            task(Admission::Busy);
            return;
        };

        match sender.try_send(task) {
            Ok(()) => {}
            Err(crossbeam_channel::TrySendError::Full(task)) => {
                trace!("Worker queue full, waiting for a slot");
                match sender.send_timeout(task, self.queue_wait) {
                    Ok(()) => {}
                    Err(SendTimeoutError::Timeout(task) | SendTimeoutError::Disconnected(task)) => {
                        self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                        warn!(wait_ms = self.queue_wait.as_millis() as u64, "Worker queue saturated, rejecting request");
                        task(Admission::Busy);
                    }
                }
            }
            Err(crossbeam_channel::TrySendError::Disconnected(task)) => task(Admission::Busy),
        }
    }

    /// Stops accepting work and waits for queued tasks to finish.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        drop(self.sender.take());
        for (i, handle) in self.workers.drain(..).enumerate() {
            if handle.join().is_err() {
                warn!(worker = i, "Worker thread panicked during shutdown");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(receiver: &Receiver<BoxedTask>, stats: &WorkerStats) {
    while let Ok(task) = receiver.recv() {
        if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| task(Admission::Run))).is_err() {
            stats.panicked.fetch_add(1, Ordering::Relaxed);
            warn!("Task panicked");
        }
    }
    trace!("Worker thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    #[test]
    fn test_tasks_run_on_workers() {
        let pool = WorkerPool::new(2, Duration::from_secs(1)).unwrap();
        let (tx, rx) = unbounded();
        for i in 0..10 {
            let tx = tx.clone();
            pool.submit(move |admission| {
                tx.send((i, admission)).unwrap();
            });
        }
        let mut seen: Vec<_> = (0..10).map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap()).collect();
        seen.sort_by_key(|(i, _)| *i);
        assert!(seen.iter().all(|(_, admission)| *admission == Admission::Run));
        assert_eq!(pool.stats().submitted_count(), 10);
        pool.shutdown();
    }

    #[test]
    fn test_saturated_queue_rejects_inline() {
        let pool = WorkerPool::new(1, Duration::from_millis(20)).unwrap();
        let (release_tx, release_rx) = bounded::<()>(0);
        let (started_tx, started_rx) = bounded::<()>(1);

        // Occupy the only worker
        pool.submit(move |_| {
            started_tx.send(()).unwrap();
            release_rx.recv().unwrap();
        });
        started_rx.recv().unwrap();
        // Fill the queue (depth 2)
        pool.submit(|_| {});
        pool.submit(|_| {});

        let (tx, rx) = unbounded();
        pool.submit(move |admission| tx.send(admission).unwrap());
        assert_eq!(rx.recv().unwrap(), Admission::Busy);
        assert_eq!(pool.stats().rejected_count(), 1);

        release_tx.send(()).unwrap();
        pool.shutdown();
    }

    #[test]
    fn test_panicking_task_does_not_kill_worker() {
        let pool = WorkerPool::new(1, Duration::from_secs(1)).unwrap();
        pool.submit(|_| panic!("boom"));
        let (tx, rx) = unbounded();
        pool.submit(move |admission| tx.send(admission).unwrap());
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), Admission::Run);
        assert_eq!(pool.stats().panicked_count(), 1);
    }
}
