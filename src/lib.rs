//! mizu-dl: a resumable, concurrent HTTP download engine.
//!
//! Three transfer strategies behind one task API:
//!
//! - [`NormalDownloader`]: sequential streaming for servers without
//!   byte-range support
//! - [`RangeDownloader`]: parallel byte ranges with crash-safe resume via
//!   a binary control file
//! - [`M3u8Downloader`]: HLS playlists, parallel segments, optional
//!   AES-128-CBC decryption, ordered merge
//!
//! The [`DownloadHub`] is the entry point: it owns the HTTP client, the
//! bounded worker queue and the task registry.
//!
//! ```no_run
//! use mizu_dl::{DownloadConfig, DownloadHub, DownloadParam};
//!
//! # async fn demo() -> mizu_dl::Result<()> {
//! let hub = DownloadHub::new(DownloadConfig::new().max_task(4))?;
//! let task = hub.download(DownloadParam::new(
//!     "https://example.com/video.mp4",
//!     "video.mp4",
//!     "/tmp/downloads",
//! ))?;
//!
//! let mut states = task.subscribe();
//! while states.changed().await.is_ok() {
//!     if states.borrow().is_end() {
//!         break;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod dispatch;
pub mod downloader;
pub mod error;
pub mod m3u8;
pub mod manager;
pub mod queue;
pub mod task;
pub mod tmpfile;
pub mod types;

pub use config::{DefaultClientFactory, DownloadConfig, HttpClientFactory};
pub use dispatch::{DefaultDispatcher, DefaultFileValidator, DownloadDispatcher, FileValidator};
pub use downloader::{Downloader, M3u8Downloader, NormalDownloader, RangeDownloader};
pub use error::{DownloadError, NetworkErrorKind, ProtocolErrorKind, Result, StorageErrorKind};
pub use manager::TaskManager;
pub use queue::DownloadQueue;
pub use task::DownloadTask;
pub use types::{DownloadParam, DownloadState, Progress};

use std::sync::Arc;

/// Engine entry point: HTTP client + worker queue + task registry.
///
/// Cloneable handles are not needed; wrap the hub in an [`Arc`] to share
/// it. Dropping the hub does not stop in-flight transfers; call
/// [`shutdown`](DownloadHub::shutdown) for an orderly stop.
pub struct DownloadHub {
    config: Arc<DownloadConfig>,
    client: reqwest::Client,
    queue: DownloadQueue,
    manager: TaskManager,
    dispatcher: Arc<dyn DownloadDispatcher>,
    validator: Arc<dyn FileValidator>,
}

impl DownloadHub {
    /// Build a hub with the default client factory, dispatcher and
    /// validator. Must be called inside a tokio runtime: the queue spawns
    /// its worker pool here.
    pub fn new(config: DownloadConfig) -> Result<Self> {
        Self::with_parts(
            config,
            &DefaultClientFactory,
            Arc::new(DefaultDispatcher),
            Arc::new(DefaultFileValidator),
        )
    }

    /// Build a hub with custom policies.
    pub fn with_parts(
        config: DownloadConfig,
        factory: &dyn HttpClientFactory,
        dispatcher: Arc<dyn DownloadDispatcher>,
        validator: Arc<dyn FileValidator>,
    ) -> Result<Self> {
        config.validate()?;
        let client = factory.create(&config)?;
        let queue = DownloadQueue::new(config.max_task);

        Ok(Self {
            config: Arc::new(config),
            client,
            queue,
            manager: TaskManager::new(),
            dispatcher,
            validator,
        })
    }

    /// Get or create the task for this param and start it. Repeated calls
    /// with the same URL return the same task.
    pub fn download(&self, param: DownloadParam) -> Result<Arc<DownloadTask>> {
        if param.url.is_empty() {
            return Err(DownloadError::invalid_input("url", "URL must not be empty"));
        }

        let task = self.manager.get_or_insert(param.tag(), || {
            DownloadTask::new(
                param.clone(),
                self.config.clone(),
                self.client.clone(),
                self.queue.clone(),
                self.dispatcher.clone(),
                self.validator.clone(),
            )
        });
        task.start()?;
        Ok(task)
    }

    /// Look up a task by tag (its URL).
    pub fn task(&self, tag: &str) -> Option<Arc<DownloadTask>> {
        self.manager.get(tag)
    }

    /// Snapshot of every registered task.
    pub fn tasks(&self) -> Vec<Arc<DownloadTask>> {
        self.manager.all()
    }

    /// Stop a task, forget it, and delete its artifacts.
    pub async fn remove(&self, tag: &str, delete_file: bool) {
        if let Some(task) = self.manager.remove(tag) {
            task.remove(delete_file).await;
        }
    }

    /// Stop every task and close the queue. In-flight transfers observe
    /// their cancellation token and land in `Stopped`.
    pub fn shutdown(&self) {
        self.queue.close();
        for task in self.manager.all() {
            task.stop();
        }
    }
}
