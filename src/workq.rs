// vim: tw=80
//! Deferred-work scheduling for the bio layer
//!
//! Checksum offload and completion-side verification both run here, off the
//! device-completion context.  Two priority classes; FIFO within a class; no
//! ordering guarantee across classes.

use std::pin::Pin;

use futures::Future;
use tokio::sync::mpsc;

/// Scheduling class of a work item.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Priority {
    /// Sync-class operations that a caller may be waiting on.
    High,
    Normal,
}

type Task = Pin<Box<dyn Future<Output = ()> + Send>>;

/// A fixed pair of worker tasks, one per priority class.
///
/// Must be created from within a tokio runtime.  Items within one class run
/// to completion in submission order.
pub struct WorkerPool {
    high: mpsc::UnboundedSender<Task>,
    normal: mpsc::UnboundedSender<Task>,
}

impl WorkerPool {
    pub fn new() -> Self {
        let (high, hrx) = mpsc::unbounded_channel();
        let (normal, nrx) = mpsc::unbounded_channel();
        tokio::spawn(Self::run(hrx));
        tokio::spawn(Self::run(nrx));
        WorkerPool { high, normal }
    }

    async fn run(mut rx: mpsc::UnboundedReceiver<Task>) {
        while let Some(task) = rx.recv().await {
            task.await;
        }
    }

    pub fn enqueue<F>(&self, prio: Priority, task: F)
        where F: Future<Output = ()> + Send + 'static
    {
        let tx = match prio {
            Priority::High => &self.high,
            Priority::Normal => &self.normal,
        };
        // Fails only at shutdown, when completions are moot anyway.
        let _ = tx.send(Box::pin(task));
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new()
    }
}

// LCOV_EXCL_STOP
