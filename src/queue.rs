//! Bounded-concurrency download queue
//!
//! Admission is unbounded (an unbounded channel), execution is bounded:
//! exactly `max_task` long-lived workers pull tasks off a shared receiver,
//! so at most `max_task` transfers run at once regardless of how many
//! tasks are waiting.
//!
//! Membership is tracked by tag in a separate set. Workers atomically
//! claim the membership when popping an entry, so a task stopped while
//! waiting (membership already withdrawn) is skipped, and a stale entry
//! left over from a stop/restart cycle can never race a fresh one into a
//! second concurrent transfer.

use crate::error::{DownloadError, Result};
use crate::task::DownloadTask;

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Clone)]
pub struct DownloadQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    tx: Mutex<Option<mpsc::UnboundedSender<Arc<DownloadTask>>>>,
    members: Mutex<HashSet<String>>,
}

impl DownloadQueue {
    /// Create the queue and spawn its worker pool.
    pub fn new(max_task: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel::<Arc<DownloadTask>>();
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let queue = Self {
            inner: Arc::new(QueueInner {
                tx: Mutex::new(Some(tx)),
                members: Mutex::new(HashSet::new()),
            }),
        };

        for id in 0..max_task {
            let rx = rx.clone();
            let queue = queue.clone();
            tokio::spawn(async move {
                loop {
                    // Hold the lock only while popping; transfers run
                    // outside it so workers drain in parallel.
                    let task = { rx.lock().await.recv().await };
                    let Some(task) = task else {
                        tracing::debug!(worker = id, "queue closed, worker exiting");
                        break;
                    };

                    if !queue.claim(task.tag()) {
                        tracing::debug!(worker = id, tag = %task.tag(), "skipping dequeued task");
                        continue;
                    }

                    task.suspend_start().await;
                }
            });
        }

        queue
    }

    /// Admit a task. Idempotent per tag: a task already in the queue is
    /// not enqueued twice.
    pub fn enqueue(&self, task: Arc<DownloadTask>) -> Result<()> {
        {
            let mut members = self.inner.members.lock();
            if !members.insert(task.tag().to_string()) {
                tracing::debug!(tag = %task.tag(), "already queued");
                return Ok(());
            }
        }

        let tx = self.inner.tx.lock();
        match tx.as_ref() {
            Some(tx) if tx.send(task.clone()).is_ok() => Ok(()),
            _ => {
                self.dequeue(task.tag());
                Err(DownloadError::Shutdown)
            }
        }
    }

    /// Withdraw a waiting task so no worker picks it up.
    pub fn dequeue(&self, tag: &str) {
        self.inner.members.lock().remove(tag);
    }

    /// Whether a task is currently queued.
    pub fn contains(&self, tag: &str) -> bool {
        self.inner.members.lock().contains(tag)
    }

    /// Atomically take a popped task's membership. Fails when the task was
    /// dequeued by `stop()` or a duplicate entry was already claimed.
    fn claim(&self, tag: &str) -> bool {
        self.inner.members.lock().remove(tag)
    }

    /// Close admission. Workers finish their current transfer, drain the
    /// channel and exit.
    pub fn close(&self) {
        self.inner.tx.lock().take();
    }
}
