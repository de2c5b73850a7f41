//! Parallel HLS (M3U8) downloader
//!
//! Resolves the playlist, downloads every segment in parallel into its own
//! temp file, then concatenates them strictly in playlist order into the
//! shadow file, decrypting with AES-128-CBC when the playlist carries a
//! key. Progress is segment-granular: `total_size` is the segment count
//! (byte totals are unknown for HLS ahead of time), while
//! `downloaded_bytes()` reports true transferred bytes for speed display.

use super::{build_request, segment_path, shadow_path, tmp_path, Downloader, TransferState};
use crate::config::DownloadConfig;
use crate::error::{DownloadError, NetworkErrorKind, ProtocolErrorKind, Result, StorageErrorKind};
use crate::m3u8::{HlsKey, M3u8Parser, MediaPlaylist};
use crate::tmpfile::{Range, RangeTmpFile, TmpCursor};
use crate::types::{DownloadParam, Progress};

use aes::Aes128;
use async_trait::async_trait;
use bytes::Bytes;
use cbc::Decryptor;
use cipher::block_padding::Pkcs7;
use cipher::{BlockDecryptMut, KeyIvInit};
use futures::{StreamExt, TryStreamExt};
use reqwest::{Client, Response};
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

/// MPEG-TS sync byte; each 188-byte packet starts with it.
const TS_SYNC_BYTE: u8 = 0x47;

/// How far into the first segment we look for the sync byte.
const TS_SYNC_SCAN_WINDOW: usize = 2 * 188;

pub struct M3u8Downloader {
    state: TransferState,
}

impl M3u8Downloader {
    pub fn new() -> Self {
        Self {
            state: TransferState::new(true),
        }
    }

    async fn prepare(&self, tmp: &Path, segment_count: u64) -> Result<RangeTmpFile> {
        match RangeTmpFile::read(tmp).await {
            Ok(existing) if existing.is_valid(segment_count, segment_count) => {
                tracing::debug!(
                    path = %tmp.display(),
                    done = existing.ranges.iter().filter(|r| r.is_complete()).count(),
                    "resuming segment download"
                );
                Ok(existing)
            }
            Ok(_) => {
                tracing::debug!(path = %tmp.display(), "segment tmp file stale, restarting");
                RangeTmpFile::create_for_segments(tmp, segment_count).await
            }
            Err(_) => RangeTmpFile::create_for_segments(tmp, segment_count).await,
        }
    }

    /// Download one segment into its own temp file. Incomplete segments
    /// restart from zero: segment servers rarely honor range requests, so
    /// the resumable unit is the whole segment.
    async fn download_segment(
        &self,
        client: &Client,
        param: &DownloadParam,
        config: &DownloadConfig,
        mut range: Range,
        url: &str,
        tmp: &Path,
        cancel: CancellationToken,
    ) -> Result<()> {
        let seg_path = segment_path(param, range.index);
        let mut file = File::create(&seg_path).await.map_err(|e| {
            DownloadError::storage(
                StorageErrorKind::Io,
                &seg_path,
                format!("create failed: {}", e),
            )
        })?;

        range.start = 0;
        range.current = 0;
        range.end = 0;
        let mut cursor = TmpCursor::open(tmp).await?;

        let response = build_request(client, url, config).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::network(
                NetworkErrorKind::HttpStatus(status.as_u16()),
                format!("segment {} request returned {}", range.index, status),
            ));
        }

        let expected = response.content_length().filter(|l| *l > 0);

        let mut stream = response.bytes_stream();
        while let Some(chunk_result) = tokio::select! {
            chunk = stream.next() => chunk,
            _ = cancel.cancelled() => None,
        } {
            let chunk: Bytes = chunk_result.map_err(|e| {
                DownloadError::network(
                    NetworkErrorKind::Other,
                    format!("segment {} stream error: {}", range.index, e),
                )
            })?;

            file.write_all(&chunk).await?;
            range.current += chunk.len() as u64;
            // Mid-stream records stay incomplete until sealed below, so a
            // crash here forces a segment restart instead of a bogus skip.
            range.end = record_end(expected, range.current);
            cursor.persist_record(&range).await?;

            self.state.add_fetched(chunk.len() as u64);
        }

        file.flush().await?;

        if cancel.is_cancelled() {
            let complete = expected.is_some_and(|len| range.current == len);
            if !complete {
                cursor.flush().await?;
                return Err(DownloadError::Cancelled);
            }
        }

        if range.current == 0 {
            return Err(DownloadError::protocol(
                ProtocolErrorKind::InvalidResponse,
                format!("segment {} body is empty", range.index),
            ));
        }
        if let Some(len) = expected {
            if range.current != len {
                return Err(DownloadError::network(
                    NetworkErrorKind::ConnectionReset,
                    format!(
                        "segment {} ended early: {} of {} bytes",
                        range.index, range.current, len
                    ),
                ));
            }
        }

        // Seal the record: for chunked responses the size is only known now.
        range.end = range.current - 1;
        cursor.persist_record(&range).await?;
        cursor.flush().await?;
        file.sync_all().await?;

        self.state.add_download(1);
        Ok(())
    }

    /// Concatenate all segments in playlist order, validating each file's
    /// on-disk length against its recorded range and decrypting when a key
    /// is present.
    async fn merge_segments(
        &self,
        param: &DownloadParam,
        tmp: &Path,
        key: Option<&HlsKey>,
    ) -> Result<()> {
        let tmp_file = RangeTmpFile::read(tmp).await?;

        let target = param.file_path().ok_or_else(|| {
            DownloadError::invalid_input("save_name", "no file name resolved for download")
        })?;
        let shadow = shadow_path(param);
        let mut out = File::create(&shadow).await?;

        for range in &tmp_file.ranges {
            let seg_path = segment_path(param, range.index);
            let data = tokio::fs::read(&seg_path).await.map_err(|e| {
                DownloadError::storage(
                    StorageErrorKind::Io,
                    &seg_path,
                    format!("segment read failed: {}", e),
                )
            })?;

            if data.len() as u64 != range.complete_size() {
                return Err(DownloadError::protocol(
                    ProtocolErrorKind::SegmentMismatch,
                    format!(
                        "segment {}: on-disk {} bytes, recorded {}",
                        range.index,
                        data.len(),
                        range.complete_size()
                    ),
                ));
            }

            let mut data = match key {
                Some(key) => decrypt_segment(&data, key)?,
                None => data,
            };
            if range.index == 0 {
                data = fix_leading_sync(data);
            }

            out.write_all(&data).await?;
        }

        out.flush().await?;
        out.sync_all().await?;
        drop(out);

        tokio::fs::rename(&shadow, &target).await.map_err(|e| {
            DownloadError::storage(StorageErrorKind::Io, &target, format!("rename failed: {}", e))
        })?;

        for range in &tmp_file.ranges {
            let seg_path = segment_path(param, range.index);
            if let Err(e) = tokio::fs::remove_file(&seg_path).await {
                tracing::debug!(path = %seg_path.display(), error = %e, "segment cleanup failed");
            }
        }
        if let Err(e) = tokio::fs::remove_file(tmp).await {
            tracing::debug!(path = %tmp.display(), error = %e, "tmp file cleanup failed");
        }

        Ok(())
    }
}

impl Default for M3u8Downloader {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Downloader for M3u8Downloader {
    async fn download(
        &self,
        client: &Client,
        param: &DownloadParam,
        config: &DownloadConfig,
        response: Response,
        cancel: CancellationToken,
    ) -> Result<()> {
        // The playlist is re-fetched by the parser; the probe body is unused.
        drop(response);

        let parser = M3u8Parser::new(client, &config.custom_headers);
        let playlist: MediaPlaylist = tokio::select! {
            result = parser.resolve(&param.url) => result?,
            _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
        };

        let segment_count = playlist.segments.len() as u64;
        self.state.set_total(segment_count);

        let target = param.file_path().ok_or_else(|| {
            DownloadError::invalid_input("save_name", "no file name resolved for download")
        })?;
        if tokio::fs::metadata(&target).await.is_ok() {
            self.state.set_download(segment_count);
            return Ok(());
        }

        let tmp = tmp_path(param);
        let tmp_file = self.prepare(&tmp, segment_count).await?;

        let done = tmp_file.ranges.iter().filter(|r| r.is_complete()).count() as u64;
        self.state.set_download(done);

        let undone = tmp_file.undone_ranges();
        tracing::debug!(
            url = %param.url,
            segments = segment_count,
            undone = undone.len(),
            encrypted = playlist.key.is_some(),
            "starting segment transfer"
        );

        futures::stream::iter(undone.into_iter().map(Ok))
            .try_for_each_concurrent(config.range_concurrency, |range| {
                let cancel = cancel.clone();
                let url = playlist.segments[range.index as usize].clone();
                let tmp = tmp.as_path();
                async move {
                    self.download_segment(client, param, config, range, &url, tmp, cancel)
                        .await
                }
            })
            .await?;

        self.merge_segments(param, &tmp, playlist.key.as_ref()).await
    }

    fn progress(&self) -> Progress {
        self.state.snapshot()
    }

    fn downloaded_bytes(&self) -> u64 {
        self.state.fetched()
    }
}

/// End offset for a mid-stream segment record. With a known length the
/// real final offset is used; without one the record's span is held open
/// at the cursor (`current == end`, never `end + 1`), keeping the
/// `start <= current <= end + 1` invariant while never marking the
/// segment complete before it is sealed.
fn record_end(expected: Option<u64>, current: u64) -> u64 {
    match expected {
        Some(len) => len - 1,
        None => current,
    }
}

/// Decrypt one AES-128-CBC segment with PKCS7 padding.
fn decrypt_segment(data: &[u8], key: &HlsKey) -> Result<Vec<u8>> {
    let decryptor = Decryptor::<Aes128>::new_from_slices(&key.key, &key.iv).map_err(|e| {
        DownloadError::protocol(
            ProtocolErrorKind::DecryptFailed,
            format!("invalid key/IV: {}", e),
        )
    })?;
    decryptor
        .decrypt_padded_vec_mut::<Pkcs7>(data)
        .map_err(|e| {
            DownloadError::protocol(
                ProtocolErrorKind::DecryptFailed,
                format!("segment decryption failed: {}", e),
            )
        })
}

/// Drop leading garbage before the first TS sync byte. Some streams carry
/// junk ahead of the first packet after a discontinuity.
fn fix_leading_sync(data: Vec<u8>) -> Vec<u8> {
    if data.first() == Some(&TS_SYNC_BYTE) {
        return data;
    }
    let window = data.len().min(TS_SYNC_SCAN_WINDOW);
    match data[..window].iter().position(|&b| b == TS_SYNC_BYTE) {
        Some(pos) => data[pos..].to_vec(),
        None => data,
    }
}
