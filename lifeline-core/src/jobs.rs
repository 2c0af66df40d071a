//! Bounded job queue and the worker pool that drains it.
//!
//! The queue carries runnable graph nodes by reference (group index, node
//! index); capacity equals the total process count so a transition round can
//! never need more slots than exist. Enqueue uses a timed wait and reports
//! failure to the caller, which retries while its graph is still in
//! transition. Stopping posts one shutdown sentinel per worker.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::warn;

use crate::pidmap::NodeRef;

/// Longest a producer waits for a queue slot before giving up a round.
pub const ENQUEUE_TIMEOUT: Duration = Duration::from_millis(500);

enum Job {
    Execute(NodeRef),
    Shutdown,
}

pub struct JobQueue {
    tx: Sender<Job>,
    rx: Receiver<Job>,
    running: AtomicBool,
}

impl JobQueue {
    pub fn new(capacity: usize) -> JobQueue {
        let (tx, rx) = bounded(capacity.max(1));
        JobQueue {
            tx,
            rx,
            running: AtomicBool::new(true),
        }
    }

    /// Offer a node to the pool. False if no slot freed up within
    /// [`ENQUEUE_TIMEOUT`] or the queue has been stopped.
    pub fn enqueue(&self, node: NodeRef) -> bool {
        if !self.is_running() {
            return false;
        }
        match self.tx.send_timeout(Job::Execute(node), ENQUEUE_TIMEOUT) {
            Ok(()) => true,
            Err(_) => {
                warn!("failed to enqueue node job; queue full or stopping");
                false
            }
        }
    }

    /// Block for the next job. `None` tells the worker to exit.
    fn take(&self) -> Option<NodeRef> {
        match self.rx.recv() {
            Ok(Job::Execute(node)) if self.is_running() => Some(node),
            _ => None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Stop the queue and wake `workers` blocked consumers.
    pub fn stop(&self, workers: usize) {
        self.running.store(false, Ordering::Release);
        for _ in 0..workers {
            // Non-blocking: if the queue is full the workers are busy and
            // will observe the running flag on their next take.
            let _ = self.tx.try_send(Job::Shutdown);
        }
    }
}

/// Fixed set of threads executing node work.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Start `count` workers. Each dequeued node is handed to `execute`.
    pub fn spawn<F>(queue: Arc<JobQueue>, count: usize, execute: Arc<F>) -> WorkerPool
    where
        F: Fn(NodeRef) + Send + Sync + 'static,
    {
        let handles = (0..count)
            .map(|index| {
                let queue = Arc::clone(&queue);
                let execute = Arc::clone(&execute);
                thread::Builder::new()
                    .name(format!("lifeline-worker-{index}"))
                    .spawn(move || {
                        while queue.is_running() {
                            if let Some(node) = queue.take() {
                                execute(node);
                            }
                        }
                    })
                    .expect("spawning worker thread")
            })
            .collect();
        WorkerPool { handles }
    }

    pub fn join(self) {
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    fn node(n: u16) -> NodeRef {
        NodeRef { group: 0, node: n }
    }

    #[test]
    fn workers_drain_jobs() {
        let queue = Arc::new(JobQueue::new(8));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let execute = {
            let seen = Arc::clone(&seen);
            Arc::new(move |n: NodeRef| {
                seen.lock().unwrap().push(n.node);
            })
        };
        let pool = WorkerPool::spawn(Arc::clone(&queue), 4, execute);
        for i in 0..8 {
            assert!(queue.enqueue(node(i)));
        }
        while seen.lock().unwrap().len() < 8 {
            thread::sleep(Duration::from_millis(5));
        }
        queue.stop(4);
        pool.join();
        let mut got = seen.lock().unwrap().clone();
        got.sort_unstable();
        assert_eq!(got, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn enqueue_times_out_when_full() {
        let queue = JobQueue::new(1);
        assert!(queue.enqueue(node(0)));
        let begin = std::time::Instant::now();
        assert!(!queue.enqueue(node(1)));
        assert!(begin.elapsed() >= ENQUEUE_TIMEOUT);
    }

    #[test]
    fn stop_wakes_blocked_workers() {
        let queue = Arc::new(JobQueue::new(4));
        let executed = Arc::new(AtomicUsize::new(0));
        let execute = {
            let executed = Arc::clone(&executed);
            Arc::new(move |_: NodeRef| {
                executed.fetch_add(1, Ordering::Relaxed);
            })
        };
        let pool = WorkerPool::spawn(Arc::clone(&queue), 2, execute);
        queue.stop(2);
        pool.join();
        assert_eq!(executed.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn enqueue_after_stop_is_rejected() {
        let queue = JobQueue::new(4);
        queue.stop(0);
        assert!(!queue.enqueue(node(0)));
    }
}
