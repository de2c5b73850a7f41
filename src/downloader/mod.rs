//! Transfer strategies
//!
//! A [`Downloader`] performs the actual transfer for one task. Strategy
//! selection happens in [`crate::dispatch`]: plain sequential streaming,
//! parallel byte-range fetching, or parallel HLS-segment fetching.

pub mod hls;
pub mod normal;
pub mod ranged;

pub use hls::M3u8Downloader;
pub use normal::NormalDownloader;
pub use ranged::RangeDownloader;

use crate::config::DownloadConfig;
use crate::error::Result;
use crate::types::{DownloadParam, Progress};

use async_trait::async_trait;
use reqwest::{Client, Response};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;

/// One transfer strategy.
///
/// `download` consumes the validated probe response; the progress queries
/// are safe to call concurrently with an in-flight transfer.
#[async_trait]
pub trait Downloader: Send + Sync {
    /// Perform the transfer. Must return [`DownloadError::Cancelled`]
    /// (never a plain failure) when `cancel` fires.
    ///
    /// [`DownloadError::Cancelled`]: crate::error::DownloadError::Cancelled
    async fn download(
        &self,
        client: &Client,
        param: &DownloadParam,
        config: &DownloadConfig,
        response: Response,
        cancel: CancellationToken,
    ) -> Result<()>;

    /// Current progress snapshot.
    fn progress(&self) -> Progress;

    /// True bytes transferred, for speed display. Matches
    /// `progress().download_size` except in M3U8 mode, where progress
    /// counts segments.
    fn downloaded_bytes(&self) -> u64;
}

/// Lock-free progress aggregation shared between parallel range workers
/// and polling readers.
#[derive(Debug, Default)]
pub(crate) struct TransferState {
    download_size: AtomicU64,
    total_size: AtomicU64,
    bytes_fetched: AtomicU64,
    chunked: AtomicBool,
}

impl TransferState {
    pub fn new(chunked: bool) -> Self {
        Self {
            chunked: AtomicBool::new(chunked),
            ..Default::default()
        }
    }

    pub fn set_total(&self, total: u64) {
        self.total_size.store(total, Ordering::Relaxed);
    }

    pub fn set_download(&self, downloaded: u64) {
        self.download_size.store(downloaded, Ordering::Relaxed);
    }

    pub fn add_download(&self, bytes: u64) {
        self.download_size.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_fetched(&self, bytes: u64) {
        self.bytes_fetched.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn fetched(&self) -> u64 {
        self.bytes_fetched.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> Progress {
        Progress {
            download_size: self.download_size.load(Ordering::Relaxed),
            total_size: self.total_size.load(Ordering::Relaxed),
            is_chunked: self.chunked.load(Ordering::Relaxed),
        }
    }
}

/// Path of the in-progress pre-allocated file, renamed to the final name
/// only after all ranges complete.
pub(crate) fn shadow_path(param: &DownloadParam) -> PathBuf {
    param.save_dir.join(format!("{}.shadow", param.save_name))
}

/// Path of the binary range control file.
pub(crate) fn tmp_path(param: &DownloadParam) -> PathBuf {
    param.save_dir.join(format!("{}.tmp", param.save_name))
}

/// Per-segment temp file for HLS downloads, named by segment index.
pub(crate) fn segment_path(param: &DownloadParam, index: u64) -> PathBuf {
    param.save_dir.join(format!("{}.{}.ts", param.save_name, index))
}

/// Total resource size reported by a probe response: the `/total` part of
/// `Content-Range` for 206 responses, falling back to `Content-Length`.
pub(crate) fn total_size_of(response: &Response) -> Option<u64> {
    if let Some(total) = response
        .headers()
        .get("content-range")
        .and_then(|v| v.to_str().ok())
        .and_then(parse_content_range)
        .and_then(|(_, _, total)| total)
    {
        return Some(total);
    }
    response.content_length()
}

/// Whether the probe response indicates byte-range support.
pub(crate) fn supports_range(response: &Response) -> bool {
    if response.status() == reqwest::StatusCode::PARTIAL_CONTENT {
        return true;
    }
    response
        .headers()
        .get("accept-ranges")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("bytes"))
        .unwrap_or(false)
}

/// Parse a `Content-Range` header: `bytes start-end/total` or
/// `bytes start-end/*`.
pub(crate) fn parse_content_range(header: &str) -> Option<(u64, u64, Option<u64>)> {
    let header = header.strip_prefix("bytes ")?;
    let (range, total) = header.split_once('/')?;
    let (start, end) = range.split_once('-')?;

    let start = start.parse::<u64>().ok()?;
    let end = end.parse::<u64>().ok()?;
    let total = if total == "*" {
        None
    } else {
        Some(total.parse::<u64>().ok()?)
    };

    Some((start, end, total))
}

/// Build a GET request carrying the config's custom headers.
pub(crate) fn build_request(
    client: &Client,
    url: &str,
    config: &DownloadConfig,
) -> reqwest::RequestBuilder {
    let mut request = client.get(url);
    for (name, value) in &config.custom_headers {
        request = request.header(name.as_str(), value.as_str());
    }
    request
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_range_parsing() {
        assert_eq!(
            parse_content_range("bytes 0-99/100"),
            Some((0, 99, Some(100)))
        );
        assert_eq!(parse_content_range("bytes 0-99/*"), Some((0, 99, None)));
        assert_eq!(parse_content_range("invalid"), None);
        assert_eq!(parse_content_range("bytes nonsense"), None);
    }

    #[test]
    fn artifact_paths() {
        let param = DownloadParam::new("https://example.com/v.mp4", "v.mp4", "/tmp/dl");
        assert_eq!(shadow_path(&param), PathBuf::from("/tmp/dl/v.mp4.shadow"));
        assert_eq!(tmp_path(&param), PathBuf::from("/tmp/dl/v.mp4.tmp"));
        assert_eq!(segment_path(&param, 7), PathBuf::from("/tmp/dl/v.mp4.7.ts"));
    }

    #[test]
    fn transfer_state_snapshot() {
        let state = TransferState::new(true);
        state.set_total(100);
        state.add_download(30);
        state.add_download(20);
        state.add_fetched(4096);

        let p = state.snapshot();
        assert_eq!(p.download_size, 50);
        assert_eq!(p.total_size, 100);
        assert!(p.is_chunked);
        assert_eq!(state.fetched(), 4096);
    }
}
