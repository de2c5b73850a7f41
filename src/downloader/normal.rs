//! Sequential whole-file downloader
//!
//! Used when the URL is not an M3U8 playlist and the server offers no
//! byte-range support (or range downloads are disabled). Streams the probe
//! response body straight into the shadow file and renames it on success.
//! There is no byte-level resume: a stopped download restarts from zero.

use super::{shadow_path, total_size_of, Downloader, TransferState};
use crate::config::DownloadConfig;
use crate::error::{DownloadError, NetworkErrorKind, Result, StorageErrorKind};
use crate::types::{DownloadParam, Progress};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use reqwest::{Client, Response};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

pub struct NormalDownloader {
    state: TransferState,
}

impl NormalDownloader {
    pub fn new() -> Self {
        Self {
            state: TransferState::new(false),
        }
    }
}

impl Default for NormalDownloader {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Downloader for NormalDownloader {
    async fn download(
        &self,
        _client: &Client,
        param: &DownloadParam,
        _config: &DownloadConfig,
        response: Response,
        cancel: CancellationToken,
    ) -> Result<()> {
        let total = total_size_of(&response).unwrap_or(0);
        self.state.set_total(total);

        let target = param.file_path().ok_or_else(|| {
            DownloadError::invalid_input("save_name", "no file name resolved for download")
        })?;

        // Exact-length file already on disk counts as downloaded.
        if total > 0 {
            if let Ok(meta) = tokio::fs::metadata(&target).await {
                if meta.len() == total {
                    self.state.set_download(total);
                    return Ok(());
                }
            }
        }

        let shadow = shadow_path(param);
        let mut file = File::create(&shadow).await.map_err(|e| {
            DownloadError::storage(StorageErrorKind::Io, &shadow, format!("create failed: {}", e))
        })?;

        let mut stream = response.bytes_stream();
        while let Some(chunk_result) = tokio::select! {
            chunk = stream.next() => chunk,
            _ = cancel.cancelled() => None,
        } {
            let chunk: Bytes = chunk_result.map_err(|e| {
                DownloadError::network(NetworkErrorKind::Other, format!("stream error: {}", e))
            })?;

            file.write_all(&chunk).await.map_err(|e| {
                DownloadError::storage(
                    StorageErrorKind::Io,
                    &shadow,
                    format!("write failed: {}", e),
                )
            })?;

            self.state.add_download(chunk.len() as u64);
            self.state.add_fetched(chunk.len() as u64);
        }

        file.flush().await?;

        if cancel.is_cancelled() {
            // Leave the shadow file behind; a restart truncates it anyway.
            return Err(DownloadError::Cancelled);
        }

        let downloaded = self.state.snapshot().download_size;
        if total > 0 && downloaded < total {
            return Err(DownloadError::network(
                NetworkErrorKind::Other,
                format!("incomplete download: {} of {} bytes", downloaded, total),
            ));
        }

        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&shadow, &target).await.map_err(|e| {
            DownloadError::storage(StorageErrorKind::Io, &target, format!("rename failed: {}", e))
        })?;

        // Chunked responses only learn the size at the end.
        if total == 0 {
            self.state.set_total(downloaded);
        }

        Ok(())
    }

    fn progress(&self) -> Progress {
        self.state.snapshot()
    }

    fn downloaded_bytes(&self) -> u64 {
        self.state.fetched()
    }
}
