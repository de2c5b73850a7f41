//! Download task lifecycle
//!
//! A [`DownloadTask`] owns the state machine for one download: it probes
//! the server, resolves the target file name, picks a strategy through the
//! dispatcher and drives the transfer. `start()` only enqueues; the actual
//! transfer runs on a queue worker via `suspend_start()`, so at most
//! `max_task` transfers are in flight at once.
//!
//! Cancellation is cooperative: `stop()` fires the task's token, the
//! active downloader returns [`DownloadError::Cancelled`] and the task
//! lands in `Stopped`, never `Failed`.

use crate::config::DownloadConfig;
use crate::dispatch::{DownloadDispatcher, FileValidator};
use crate::downloader::{build_request, total_size_of, Downloader};
use crate::error::{DownloadError, NetworkErrorKind, Result, StorageErrorKind};
use crate::queue::DownloadQueue;
use crate::tmpfile::RangeTmpFile;
use crate::types::{DownloadParam, DownloadState, Progress};

use futures::Stream;
use parking_lot::{Mutex, RwLock};
use reqwest::{Client, Response, StatusCode};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

pub struct DownloadTask {
    tag: String,
    param: RwLock<DownloadParam>,
    config: Arc<DownloadConfig>,
    client: Client,
    queue: DownloadQueue,
    dispatcher: Arc<dyn DownloadDispatcher>,
    validator: Arc<dyn FileValidator>,
    state_tx: watch::Sender<DownloadState>,
    cancel: Mutex<CancellationToken>,
    /// Bumped by every `start()`; a finished attempt whose generation no
    /// longer matches was superseded by a restart and must not publish a
    /// terminal state over the new attempt's.
    generation: AtomicU64,
    /// Serializes attempt bodies so two queue entries for the same task
    /// can never transfer concurrently.
    run_lock: tokio::sync::Mutex<()>,
    downloader: RwLock<Option<Arc<dyn Downloader>>>,
    /// Progress substitute when the validator short-circuits the transfer.
    resolved_progress: Mutex<Option<Progress>>,
}

impl DownloadTask {
    pub(crate) fn new(
        param: DownloadParam,
        config: Arc<DownloadConfig>,
        client: Client,
        queue: DownloadQueue,
        dispatcher: Arc<dyn DownloadDispatcher>,
        validator: Arc<dyn FileValidator>,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(DownloadState::None);
        Arc::new(Self {
            tag: param.tag().to_string(),
            param: RwLock::new(param),
            config,
            client,
            queue,
            dispatcher,
            validator,
            state_tx,
            cancel: Mutex::new(CancellationToken::new()),
            generation: AtomicU64::new(0),
            run_lock: tokio::sync::Mutex::new(()),
            downloader: RwLock::new(None),
            resolved_progress: Mutex::new(None),
        })
    }

    /// Stable task identity; equals the source URL.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Enqueue this task for download. No-op while the task is already
    /// waiting or downloading.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if !self.state().can_start() {
            tracing::debug!(tag = %self.tag, "start ignored, task already active");
            return Ok(());
        }

        // Fresh token per attempt so an old stop() cannot kill a restart.
        *self.cancel.lock() = CancellationToken::new();
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.notify(DownloadState::Waiting);
        if let Err(e) = self.queue.enqueue(self.clone()) {
            self.notify(DownloadState::Failed {
                message: e.to_string(),
            });
            return Err(e);
        }
        Ok(())
    }

    /// Run the transfer to completion. Called by a queue worker; sets the
    /// terminal state and never propagates errors upward.
    pub(crate) async fn suspend_start(&self) {
        let _attempt = self.run_lock.lock().await;
        let generation = self.generation.load(Ordering::SeqCst);

        let cancel = self.cancel.lock().clone();
        if cancel.is_cancelled() {
            self.notify(DownloadState::Stopped);
            return;
        }

        let result = self.run(cancel).await;
        if self.generation.load(Ordering::SeqCst) != generation {
            tracing::debug!(tag = %self.tag, "attempt superseded by a restart");
            return;
        }

        match result {
            Ok(()) => {
                tracing::info!(tag = %self.tag, "download succeeded");
                self.notify(DownloadState::Succeed);
            }
            Err(e) if e.is_cancelled() => {
                tracing::info!(tag = %self.tag, "download stopped");
                self.notify(DownloadState::Stopped);
            }
            Err(e) => {
                tracing::warn!(tag = %self.tag, error = %e, "download failed");
                self.notify(DownloadState::Failed {
                    message: e.to_string(),
                });
            }
        }
    }

    async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let dir = self.param.read().save_dir.clone();
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            DownloadError::storage(
                StorageErrorKind::Io,
                &dir,
                format!("create save dir failed: {}", e),
            )
        })?;

        let url = self.param.read().url.clone();
        // `Range: bytes=0-` probes for range support without a second
        // request; servers without support just answer 200.
        let request = build_request(&self.client, &url, &self.config).header("Range", "bytes=0-");
        let response = tokio::select! {
            result = request.send() => result?,
            _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
        };

        let status = response.status();
        if status != StatusCode::PARTIAL_CONTENT && !status.is_success() {
            return Err(DownloadError::network(
                NetworkErrorKind::HttpStatus(status.as_u16()),
                format!("probe request returned {}", status),
            ));
        }

        self.resolve_save_name(&response)?;
        let param = self.param.read().clone();

        if let Some(path) = param.file_path() {
            if self.validator.validate(&path, &response).await {
                tracing::debug!(tag = %self.tag, path = %path.display(), "file already valid");
                let total = total_size_of(&response).unwrap_or(0);
                *self.resolved_progress.lock() = Some(Progress::new(total, total, false));
                return Ok(());
            }
        }

        let downloader = self.dispatcher.dispatch(&param, &self.config, &response);
        *self.downloader.write() = Some(downloader.clone());
        self.notify(DownloadState::Downloading);

        downloader
            .download(&self.client, &param, &self.config, response, cancel)
            .await
    }

    /// Fill in `save_name` from the response when the caller left it empty.
    fn resolve_save_name(&self, response: &Response) -> Result<()> {
        if !self.param.read().save_name.is_empty() {
            return Ok(());
        }

        let url = self.param.read().url.clone();
        let name = save_name_from_disposition(response)
            .or_else(|| save_name_from_url(&url))
            .ok_or_else(|| {
                DownloadError::invalid_input("save_name", "could not derive a file name")
            })?;
        let name = sanitize_file_name(&name)?;

        tracing::debug!(tag = %self.tag, name = %name, "resolved save name");
        self.param.write().save_name = name;
        Ok(())
    }

    /// Stop an in-flight or waiting download. The task ends in `Stopped`
    /// and can be resumed with `start()`.
    pub fn stop(&self) {
        if !self.state().is_started() {
            return;
        }
        self.cancel.lock().cancel();
        if self.state() == DownloadState::Waiting {
            // Not picked up by a worker yet; drop it from the queue here.
            self.queue.dequeue(&self.tag);
            self.notify(DownloadState::Stopped);
        }
    }

    /// Stop the task and delete its on-disk artifacts. The final file is
    /// only removed when `delete_file` is set.
    pub async fn remove(&self, delete_file: bool) {
        self.stop();

        let param = self.param.read().clone();
        let tmp = crate::downloader::tmp_path(&param);

        // Segment temp files are enumerable through the control file.
        if let Ok(tmp_file) = RangeTmpFile::read(&tmp).await {
            for range in &tmp_file.ranges {
                let seg = crate::downloader::segment_path(&param, range.index);
                let _ = tokio::fs::remove_file(&seg).await;
            }
        }

        let _ = tokio::fs::remove_file(&tmp).await;
        let _ = tokio::fs::remove_file(crate::downloader::shadow_path(&param)).await;
        if delete_file {
            if let Some(path) = param.file_path() {
                let _ = tokio::fs::remove_file(&path).await;
            }
        }

        self.notify(DownloadState::None);
    }

    fn notify(&self, state: DownloadState) {
        self.state_tx.send_replace(state);
    }

    /// Current lifecycle state.
    pub fn state(&self) -> DownloadState {
        self.state_tx.borrow().clone()
    }

    /// Watch channel carrying every state transition.
    pub fn subscribe(&self) -> watch::Receiver<DownloadState> {
        self.state_tx.subscribe()
    }

    pub fn is_started(&self) -> bool {
        self.state().is_started()
    }

    pub fn is_succeed(&self) -> bool {
        self.state() == DownloadState::Succeed
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.state(), DownloadState::Failed { .. })
    }

    pub fn can_start(&self) -> bool {
        self.state().can_start()
    }

    /// Final target path, or `None` while the save name is unresolved.
    pub fn file(&self) -> Option<PathBuf> {
        self.param.read().file_path()
    }

    /// Current progress snapshot.
    pub fn progress(&self) -> Progress {
        if let Some(downloader) = self.downloader.read().as_ref() {
            return downloader.progress();
        }
        (*self.resolved_progress.lock()).unwrap_or_default()
    }

    /// True bytes transferred in the current attempt, for speed display.
    pub fn downloaded_bytes(&self) -> u64 {
        self.downloader
            .read()
            .as_ref()
            .map(|d| d.downloaded_bytes())
            .unwrap_or(0)
    }

    /// Poll progress on a fixed interval. The stream yields one final
    /// snapshot after the task reaches a terminal state, then ends.
    pub fn progress_stream(
        self: &Arc<Self>,
        interval: Duration,
    ) -> impl Stream<Item = Progress> + Send {
        let task = self.clone();
        futures::stream::unfold(false, move |done| {
            let task = task.clone();
            async move {
                if done {
                    return None;
                }
                tokio::time::sleep(interval).await;
                let progress = task.progress();
                let ended = task.state().is_end() || progress.is_complete();
                Some((progress, ended))
            }
        })
    }
}

/// Extract a file name from `Content-Disposition`, preferring the RFC 5987
/// `filename*` form over the plain `filename` parameter.
fn save_name_from_disposition(response: &Response) -> Option<String> {
    let header = response
        .headers()
        .get("content-disposition")?
        .to_str()
        .ok()?;

    for part in header.split(';').map(str::trim) {
        if let Some(value) = part.strip_prefix("filename*=") {
            // filename*=UTF-8''percent%20encoded
            let value = value.trim_matches('"');
            let encoded = value.rsplit("''").next()?;
            let decoded = urlencoding::decode(encoded).ok()?;
            if !decoded.is_empty() {
                return Some(decoded.into_owned());
            }
        }
    }
    for part in header.split(';').map(str::trim) {
        if let Some(value) = part.strip_prefix("filename=") {
            let value = value.trim_matches('"');
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}

/// Fall back to the last path segment of the URL, percent-decoded.
fn save_name_from_url(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let last = parsed.path_segments()?.filter(|s| !s.is_empty()).next_back()?;
    let decoded = urlencoding::decode(last).ok()?;
    if decoded.is_empty() {
        None
    } else {
        Some(decoded.into_owned())
    }
}

/// Reject names that would escape the save directory.
fn sanitize_file_name(name: &str) -> Result<String> {
    if name.contains('/') || name.contains('\\') || name.contains("..") {
        return Err(DownloadError::storage(
            StorageErrorKind::PathTraversal,
            name,
            "file name must not contain path separators",
        ));
    }
    Ok(name.to_string())
}
