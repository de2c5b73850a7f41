//! Task registry
//!
//! One [`DownloadTask`] per tag; repeated requests for the same URL return
//! the existing task instead of spawning a duplicate transfer.

use crate::task::DownloadTask;

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Default)]
pub struct TaskManager {
    tasks: RwLock<HashMap<String, Arc<DownloadTask>>>,
}

impl TaskManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the existing task for this tag, or build and register one.
    pub fn get_or_insert<F>(&self, tag: &str, build: F) -> Arc<DownloadTask>
    where
        F: FnOnce() -> Arc<DownloadTask>,
    {
        if let Some(task) = self.tasks.read().get(tag) {
            return task.clone();
        }

        let mut tasks = self.tasks.write();
        // Double-check under the write lock; another caller may have won.
        if let Some(task) = tasks.get(tag) {
            return task.clone();
        }
        let task = build();
        tasks.insert(tag.to_string(), task.clone());
        task
    }

    pub fn get(&self, tag: &str) -> Option<Arc<DownloadTask>> {
        self.tasks.read().get(tag).cloned()
    }

    pub fn remove(&self, tag: &str) -> Option<Arc<DownloadTask>> {
        self.tasks.write().remove(tag)
    }

    /// Snapshot of every registered task.
    pub fn all(&self) -> Vec<Arc<DownloadTask>> {
        self.tasks.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.read().is_empty()
    }
}
