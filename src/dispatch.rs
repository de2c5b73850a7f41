//! Strategy selection and completion validation
//!
//! The dispatcher inspects the URL and the probe response and picks the
//! transfer strategy; the validator decides whether an existing file on
//! disk already satisfies the download. Both are trait objects so callers
//! can swap in their own policies.

use crate::config::DownloadConfig;
use crate::downloader::{
    supports_range, total_size_of, Downloader, M3u8Downloader, NormalDownloader, RangeDownloader,
};
use crate::types::DownloadParam;

use async_trait::async_trait;
use reqwest::Response;
use std::path::Path;
use std::sync::Arc;

/// Picks the transfer strategy for one task.
pub trait DownloadDispatcher: Send + Sync {
    fn dispatch(
        &self,
        param: &DownloadParam,
        config: &DownloadConfig,
        response: &Response,
    ) -> Arc<dyn Downloader>;
}

/// Default policy: M3U8 URLs get the segment downloader; everything else
/// gets ranges when the server supports them and they are not disabled.
#[derive(Debug, Default)]
pub struct DefaultDispatcher;

impl DownloadDispatcher for DefaultDispatcher {
    fn dispatch(
        &self,
        param: &DownloadParam,
        config: &DownloadConfig,
        response: &Response,
    ) -> Arc<dyn Downloader> {
        if param.url.contains("m3u8") {
            tracing::debug!(url = %param.url, "dispatching m3u8 downloader");
            return Arc::new(M3u8Downloader::new());
        }
        if config.disable_range_download || !supports_range(response) {
            tracing::debug!(url = %param.url, "dispatching normal downloader");
            return Arc::new(NormalDownloader::new());
        }
        tracing::debug!(url = %param.url, "dispatching range downloader");
        Arc::new(RangeDownloader::new())
    }
}

/// Decides whether an already-present file counts as a finished download.
#[async_trait]
pub trait FileValidator: Send + Sync {
    async fn validate(&self, path: &Path, response: &Response) -> bool;
}

/// Default policy: the file is valid when its length equals the size the
/// server reports. Unknown server size never validates.
#[derive(Debug, Default)]
pub struct DefaultFileValidator;

#[async_trait]
impl FileValidator for DefaultFileValidator {
    async fn validate(&self, path: &Path, response: &Response) -> bool {
        let Some(total) = total_size_of(response) else {
            return false;
        };
        match tokio::fs::metadata(path).await {
            Ok(meta) => meta.is_file() && meta.len() == total,
            Err(_) => false,
        }
    }
}
