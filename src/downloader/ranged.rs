//! Parallel byte-range downloader
//!
//! Slices the resource into fixed-size ranges, transfers them with bounded
//! concurrency, and records per-range cursors in the tmp file after every
//! chunk so a crash or stop resumes from the last flushed byte. The shadow
//! file is pre-allocated to the full length; each range worker owns an
//! exclusive region of it, so workers need no synchronization between them.

use super::{build_request, shadow_path, tmp_path, total_size_of, Downloader, TransferState};
use crate::config::DownloadConfig;
use crate::error::{DownloadError, NetworkErrorKind, ProtocolErrorKind, Result, StorageErrorKind};
use crate::tmpfile::{Range, RangeTmpFile, TmpCursor};
use crate::types::{DownloadParam, Progress};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use reqwest::{Client, Response, StatusCode};
use std::io::SeekFrom;
use std::path::Path;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

pub struct RangeDownloader {
    state: TransferState,
}

impl RangeDownloader {
    pub fn new() -> Self {
        Self {
            state: TransferState::new(true),
        }
    }

    /// Reuse a valid tmp/shadow pair, or re-slice from scratch when the
    /// server-reported size no longer matches (content changed) or the
    /// control file is corrupt.
    async fn prepare(
        &self,
        shadow: &Path,
        tmp: &Path,
        total_size: u64,
        range_size: u64,
    ) -> Result<RangeTmpFile> {
        let total_ranges = total_size.div_ceil(range_size);

        let shadow_len = tokio::fs::metadata(shadow).await.map(|m| m.len()).ok();
        if shadow_len == Some(total_size) {
            match RangeTmpFile::read(tmp).await {
                Ok(existing) if existing.is_valid(total_size, total_ranges) => {
                    tracing::debug!(
                        path = %tmp.display(),
                        done = existing.downloaded_size(),
                        "resuming from tmp file"
                    );
                    return Ok(existing);
                }
                Ok(_) => {
                    tracing::debug!(path = %tmp.display(), "tmp file stale, re-slicing")
                }
                Err(e) => {
                    tracing::debug!(path = %tmp.display(), error = %e, "tmp file invalid, re-slicing")
                }
            }
        }

        let file = File::create(shadow).await.map_err(|e| {
            DownloadError::storage(StorageErrorKind::Io, shadow, format!("create failed: {}", e))
        })?;
        file.set_len(total_size).await.map_err(|e| {
            DownloadError::storage(
                StorageErrorKind::Io,
                shadow,
                format!("pre-allocate failed: {}", e),
            )
        })?;

        RangeTmpFile::create(tmp, total_size, range_size).await
    }

    async fn download_range(
        &self,
        client: &Client,
        param: &DownloadParam,
        config: &DownloadConfig,
        mut range: Range,
        shadow: &Path,
        tmp: &Path,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut shadow_file = OpenOptions::new().write(true).open(shadow).await?;
        shadow_file.seek(SeekFrom::Start(range.current)).await?;
        let mut cursor = TmpCursor::open(tmp).await?;

        let response = build_request(client, &param.url, config)
            .header("Range", format!("bytes={}-{}", range.current, range.end))
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::PARTIAL_CONTENT && !status.is_success() {
            return Err(DownloadError::network(
                NetworkErrorKind::HttpStatus(status.as_u16()),
                format!("range {} request returned {}", range.index, status),
            ));
        }

        let mut stream = response.bytes_stream();
        while let Some(chunk_result) = tokio::select! {
            chunk = stream.next() => chunk,
            _ = cancel.cancelled() => None,
        } {
            let chunk: Bytes = chunk_result.map_err(|e| {
                DownloadError::network(
                    NetworkErrorKind::Other,
                    format!("range {} stream error: {}", range.index, e),
                )
            })?;

            let len = chunk.len() as u64;
            if range.current + len > range.end + 1 {
                return Err(DownloadError::protocol(
                    ProtocolErrorKind::InvalidResponse,
                    format!(
                        "range {} overflow: server sent past byte {}",
                        range.index, range.end
                    ),
                ));
            }

            shadow_file.write_all(&chunk).await?;
            range.current += len;

            // Crash-safe checkpoint: the cursor hits disk before we pull
            // the next chunk.
            cursor.persist_cursor(&range).await?;

            self.state.add_download(len);
            self.state.add_fetched(len);
        }

        shadow_file.flush().await?;
        cursor.flush().await?;

        if cancel.is_cancelled() && !range.is_complete() {
            return Err(DownloadError::Cancelled);
        }

        if !range.is_complete() {
            return Err(DownloadError::network(
                NetworkErrorKind::ConnectionReset,
                format!(
                    "range {} ended early: {} of {} bytes",
                    range.index,
                    range.complete_size(),
                    range.end - range.start + 1
                ),
            ));
        }

        Ok(())
    }
}

impl Default for RangeDownloader {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Downloader for RangeDownloader {
    async fn download(
        &self,
        client: &Client,
        param: &DownloadParam,
        config: &DownloadConfig,
        response: Response,
        cancel: CancellationToken,
    ) -> Result<()> {
        let total_size = total_size_of(&response).ok_or_else(|| {
            DownloadError::protocol(
                ProtocolErrorKind::InvalidResponse,
                "range download requires a known content length",
            )
        })?;
        // Range workers issue their own requests; the probe body is unused.
        drop(response);

        self.state.set_total(total_size);

        let target = param.file_path().ok_or_else(|| {
            DownloadError::invalid_input("save_name", "no file name resolved for download")
        })?;
        if let Ok(meta) = tokio::fs::metadata(&target).await {
            if meta.len() == total_size {
                self.state.set_download(total_size);
                return Ok(());
            }
        }

        let shadow = shadow_path(param);
        let tmp = tmp_path(param);
        let tmp_file = self
            .prepare(&shadow, &tmp, total_size, config.range_size)
            .await?;

        self.state.set_download(tmp_file.downloaded_size());

        let undone = tmp_file.undone_ranges();
        tracing::debug!(
            url = %param.url,
            total = total_size,
            ranges = tmp_file.ranges.len(),
            undone = undone.len(),
            "starting range transfer"
        );

        futures::stream::iter(undone.into_iter().map(Ok))
            .try_for_each_concurrent(config.range_concurrency, |range| {
                let cancel = cancel.clone();
                let shadow = shadow.as_path();
                let tmp = tmp.as_path();
                async move {
                    self.download_range(client, param, config, range, shadow, tmp, cancel)
                        .await
                }
            })
            .await?;

        let file = OpenOptions::new().write(true).open(&shadow).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&shadow, &target).await.map_err(|e| {
            DownloadError::storage(StorageErrorKind::Io, &target, format!("rename failed: {}", e))
        })?;
        if let Err(e) = tokio::fs::remove_file(&tmp).await {
            tracing::debug!(path = %tmp.display(), error = %e, "tmp file cleanup failed");
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
