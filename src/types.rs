//! Core types: download identity, progress snapshots and the task state enum.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Identifies one logical download: source URL, target file name, target
/// directory. Two params with equal [`tag`](DownloadParam::tag)s are the
/// same task for deduplication and queueing purposes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadParam {
    /// Source URL
    pub url: String,
    /// Target file name; empty means "pick from the response"
    pub save_name: String,
    /// Target directory
    pub save_dir: PathBuf,
}

impl DownloadParam {
    pub fn new(url: impl Into<String>, save_name: impl Into<String>, save_dir: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            save_name: save_name.into(),
            save_dir: save_dir.into(),
        }
    }

    /// Unique identity used for deduplication and queue membership.
    pub fn tag(&self) -> &str {
        &self.url
    }

    /// Final target path, or `None` while the save name is still unknown.
    pub fn file_path(&self) -> Option<PathBuf> {
        if self.save_name.is_empty() {
            None
        } else {
            Some(self.save_dir.join(&self.save_name))
        }
    }
}

/// Point-in-time progress snapshot.
///
/// For M3U8 downloads `download_size`/`total_size` are segment counts, not
/// bytes; true transferred bytes are reported separately by the downloader
/// for speed display.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    /// Bytes (or segments) downloaded so far
    pub download_size: u64,
    /// Total bytes (or segments); 0 while unknown
    pub total_size: u64,
    /// True for range/segment downloads, false for plain streaming
    pub is_chunked: bool,
}

impl Progress {
    pub fn new(download_size: u64, total_size: u64, is_chunked: bool) -> Self {
        Self {
            download_size,
            total_size,
            is_chunked,
        }
    }

    /// Completion fraction in `0.0..=1.0`.
    pub fn progress(&self) -> f32 {
        if self.total_size == 0 {
            0.0
        } else {
            (self.download_size as f64 / self.total_size as f64) as f32
        }
    }

    /// Human-readable percentage, e.g. `"42.0%"`.
    pub fn percent_str(&self) -> String {
        format!("{:.1}%", self.progress() * 100.0)
    }

    pub fn is_complete(&self) -> bool {
        self.total_size > 0 && self.total_size == self.download_size
    }
}

/// Lifecycle state of a [`DownloadTask`](crate::task::DownloadTask).
///
/// Created `None`; transitions only through the task's notify methods.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum DownloadState {
    /// Never started
    None,
    /// Enqueued, waiting for a download slot
    Waiting,
    /// Actively transferring
    Downloading,
    /// Explicitly stopped; resumable with `start()`
    Stopped,
    /// Failed with an error; resumable with `start()`
    Failed { message: String },
    /// File fully materialized
    Succeed,
}

impl DownloadState {
    /// Terminal for progress-polling purposes.
    pub fn is_end(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed { .. } | Self::Succeed)
    }

    /// Whether `start()` is currently allowed.
    pub fn can_start(&self) -> bool {
        !matches!(self, Self::Waiting | Self::Downloading)
    }

    /// Whether the task is enqueued or transferring.
    pub fn is_started(&self) -> bool {
        matches!(self, Self::Waiting | Self::Downloading)
    }
}
