//! On-disk range control file
//!
//! The tmp file is the durable source of truth for resuming partial
//! downloads across process restarts. Layout (big-endian, fixed width):
//!
//! ```text
//! header:  6-byte magic | u64 total_size | u64 total_ranges      (22 bytes)
//! content: total_ranges records of
//!          u64 index | u64 start | u64 current | u64 end         (32 bytes each)
//! ```
//!
//! A record's `current` cursor is rewritten in place after every streamed
//! chunk, so a crash mid-range loses at most the bytes since the last flush.
//! A tmp file whose header no longer matches the server-reported
//! `(total_size, total_ranges)` is discarded and ranges are re-sliced.

use crate::error::{DownloadError, ProtocolErrorKind, Result};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

/// Magic constant identifying a mizu-dl tmp file.
pub const FILE_HEADER_MAGIC: [u8; 6] = [0xa1, 0xb2, 0xc3, 0xd4, 0xe5, 0xf6];

/// Header size: magic + total_size + total_ranges.
pub const FILE_HEADER_SIZE: u64 = FILE_HEADER_MAGIC.len() as u64 + 16;

/// Fixed size of one serialized [`Range`] record.
pub const RANGE_RECORD_SIZE: u64 = 32;

/// Byte offset of the `current` field within a record.
const CURSOR_FIELD_OFFSET: u64 = 16;

/// A contiguous byte span of the target resource.
///
/// `current` is the next unwritten byte offset, a cursor moving from
/// `start` to `end + 1`. Invariant: `start <= current <= end + 1`.
///
/// For M3U8 mode, `start`/`end` begin as zero placeholders per segment;
/// `end` is filled in once the segment's size is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    /// 0-based chunk or segment number
    pub index: u64,
    /// Span origin (inclusive)
    pub start: u64,
    /// Next unwritten byte offset
    pub current: u64,
    /// Span's last byte (inclusive)
    pub end: u64,
}

impl Range {
    pub fn new(index: u64, start: u64, end: u64) -> Self {
        Self {
            index,
            start,
            current: start,
            end,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.current == self.end + 1
    }

    pub fn complete_size(&self) -> u64 {
        self.current - self.start
    }

    pub fn remaining_size(&self) -> u64 {
        (self.end + 1).saturating_sub(self.current)
    }

    /// Absolute offset of this range's record within the tmp file.
    pub fn record_offset(&self) -> u64 {
        FILE_HEADER_SIZE + RANGE_RECORD_SIZE * self.index
    }

    /// Absolute offset of this range's `current` field within the tmp file.
    pub fn cursor_offset(&self) -> u64 {
        self.record_offset() + CURSOR_FIELD_OFFSET
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64(self.index);
        buf.put_u64(self.start);
        buf.put_u64(self.current);
        buf.put_u64(self.end);
    }

    fn decode(buf: &mut Bytes) -> Self {
        Self {
            index: buf.get_u64(),
            start: buf.get_u64(),
            current: buf.get_u64(),
            end: buf.get_u64(),
        }
    }
}

/// Fixed-size tmp file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    pub total_size: u64,
    pub total_ranges: u64,
}

impl FileHeader {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(&FILE_HEADER_MAGIC);
        buf.put_u64(self.total_size);
        buf.put_u64(self.total_ranges);
    }

    fn decode(buf: &mut Bytes) -> Result<Self> {
        if buf.remaining() < FILE_HEADER_SIZE as usize {
            return Err(DownloadError::protocol(
                ProtocolErrorKind::InvalidResponse,
                "tmp file truncated before header",
            ));
        }
        let mut magic = [0u8; 6];
        buf.copy_to_slice(&mut magic);
        if magic != FILE_HEADER_MAGIC {
            return Err(DownloadError::protocol(
                ProtocolErrorKind::InvalidResponse,
                "tmp file magic mismatch",
            ));
        }
        Ok(Self {
            total_size: buf.get_u64(),
            total_ranges: buf.get_u64(),
        })
    }
}

/// Parsed representation of a tmp file.
#[derive(Debug)]
pub struct RangeTmpFile {
    path: PathBuf,
    pub header: FileHeader,
    pub ranges: Vec<Range>,
}

/// Partition `[0, total_size)` into fixed-size ranges; the last range
/// absorbs the remainder and ends at `total_size - 1`.
pub fn slice_ranges(total_size: u64, range_size: u64) -> Vec<Range> {
    debug_assert!(total_size > 0 && range_size > 0);
    let count = total_size.div_ceil(range_size);
    (0..count)
        .map(|i| {
            let start = i * range_size;
            let end = if i == count - 1 {
                total_size - 1
            } else {
                start + range_size - 1
            };
            Range::new(i, start, end)
        })
        .collect()
}

impl RangeTmpFile {
    /// Create a fresh tmp file for a byte-range download, replacing any
    /// existing file at `path`.
    pub async fn create(path: impl Into<PathBuf>, total_size: u64, range_size: u64) -> Result<Self> {
        let ranges = slice_ranges(total_size, range_size);
        let header = FileHeader {
            total_size,
            total_ranges: ranges.len() as u64,
        };
        let file = Self {
            path: path.into(),
            header,
            ranges,
        };
        file.write_all().await?;
        Ok(file)
    }

    /// Create a fresh tmp file for an HLS download. `total_size` is the
    /// segment count; ranges start as zero placeholders and are filled in
    /// once each segment's size is known.
    pub async fn create_for_segments(path: impl Into<PathBuf>, segment_count: u64) -> Result<Self> {
        let ranges = (0..segment_count).map(|i| Range::new(i, 0, 0)).collect();
        let header = FileHeader {
            total_size: segment_count,
            total_ranges: segment_count,
        };
        let file = Self {
            path: path.into(),
            header,
            ranges,
        };
        file.write_all().await?;
        Ok(file)
    }

    /// Read and parse an existing tmp file.
    pub async fn read(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let raw = tokio::fs::read(&path).await?;
        let mut buf = Bytes::from(raw);

        let header = FileHeader::decode(&mut buf)?;
        let expected = header.total_ranges as usize * RANGE_RECORD_SIZE as usize;
        if buf.remaining() < expected {
            return Err(DownloadError::protocol(
                ProtocolErrorKind::InvalidResponse,
                format!(
                    "tmp file truncated: {} content bytes, expected {}",
                    buf.remaining(),
                    expected
                ),
            ));
        }

        let ranges = (0..header.total_ranges)
            .map(|_| Range::decode(&mut buf))
            .collect();

        Ok(Self {
            path,
            header,
            ranges,
        })
    }

    /// Whether this tmp file may be resumed against the server's currently
    /// reported size and range count.
    pub fn is_valid(&self, total_size: u64, total_ranges: u64) -> bool {
        self.header.total_size == total_size && self.header.total_ranges == total_ranges
    }

    /// Ranges still needing transfer, in index order.
    pub fn undone_ranges(&self) -> Vec<Range> {
        self.ranges
            .iter()
            .filter(|r| !r.is_complete())
            .copied()
            .collect()
    }

    /// Sum of completed bytes across all ranges.
    pub fn downloaded_size(&self) -> u64 {
        self.ranges.iter().map(|r| r.complete_size()).sum()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Serialize header + all records and write the whole file.
    async fn write_all(&self) -> Result<()> {
        let mut buf = BytesMut::with_capacity(
            FILE_HEADER_SIZE as usize + self.ranges.len() * RANGE_RECORD_SIZE as usize,
        );
        self.header.encode(&mut buf);
        for range in &self.ranges {
            range.encode(&mut buf);
        }
        tokio::fs::write(&self.path, &buf).await?;
        Ok(())
    }
}

/// Write handle updating individual records in place.
///
/// Each range worker opens its own cursor; records are disjoint so
/// concurrent workers never overlap.
pub struct TmpCursor {
    file: File,
}

impl TmpCursor {
    pub async fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().write(true).open(path).await?;
        Ok(Self { file })
    }

    /// Persist just the `current` cursor of `range` at its fixed offset.
    pub async fn persist_cursor(&mut self, range: &Range) -> Result<()> {
        self.file.seek(SeekFrom::Start(range.cursor_offset())).await?;
        self.file.write_all(&range.current.to_be_bytes()).await?;
        Ok(())
    }

    /// Persist the whole 32-byte record of `range` (HLS mode updates
    /// `end` once the segment size is known).
    pub async fn persist_record(&mut self, range: &Range) -> Result<()> {
        let mut buf = BytesMut::with_capacity(RANGE_RECORD_SIZE as usize);
        range.encode(&mut buf);
        self.file.seek(SeekFrom::Start(range.record_offset())).await?;
        self.file.write_all(&buf).await?;
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<()> {
        self.file.flush().await?;
        Ok(())
    }
}
