//! Format-neutral view of an archive: directory records, the reader
//! capability that produces them, and the entries handed to callers.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::{BoxStream, Stream, StreamExt};
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::backpressure::ControlledStream;
use crate::error::Result;

/// A finite stream of decoded entry bytes
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// One directory record as enumerated from the archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryRecord {
    /// Position in the archive's directory (format-defined order)
    pub index: usize,
    /// Archive-relative, path-like name
    pub name: String,
    /// Declared size of the decoded content
    pub uncompressed_size: u64,
    /// Size of the stored (possibly compressed) content
    pub compressed_size: u64,
    /// Whether the record describes a directory
    pub is_directory: bool,
}

impl EntryRecord {
    /// Metadata-only record, mostly useful for filtering
    pub fn new(name: impl Into<String>, uncompressed_size: u64, is_directory: bool) -> Self {
        Self {
            index: 0,
            name: name.into(),
            uncompressed_size,
            compressed_size: uncompressed_size,
            is_directory,
        }
    }
}

/// Archive reader capability
///
/// Yields the archive's directory records and opens a decoded content stream
/// for any one of them. Implemented for ZIP by
/// [`ZipArchiveReader`](crate::zip::ZipArchiveReader).
#[async_trait]
pub trait ArchiveReader: Send + Sync {
    /// Enumerate every directory record in format-defined order
    async fn records(&self) -> Result<Vec<EntryRecord>>;

    /// Open the decoded content of a file record
    ///
    /// The returned stream yields exactly `record.uncompressed_size` bytes or
    /// fails.
    async fn open(&self, record: &EntryRecord) -> Result<ByteStream>;
}

/// Content of a yielded entry
///
/// Directories carry an already-finished stream; files carry a stream wrapped
/// by the backpressure handler, which decodes nothing until it is polled.
pub enum EntryContent {
    Empty,
    Stream(ControlledStream),
}

impl EntryContent {
    /// Decoded bytes waiting to be read; zero until the content is first polled
    pub fn buffered_bytes(&self) -> usize {
        match self {
            EntryContent::Empty => 0,
            EntryContent::Stream(stream) => stream.buffered_bytes(),
        }
    }

    /// Drain the remaining content into memory
    pub async fn read_to_end(&mut self) -> Result<Bytes> {
        let mut out = BytesMut::new();
        while let Some(unit) = self.next().await {
            out.extend_from_slice(&unit?);
        }
        Ok(out.freeze())
    }

    /// Drain the remaining content, returning only the number of bytes seen
    pub async fn drain(&mut self) -> Result<u64> {
        let mut total = 0u64;
        while let Some(unit) = self.next().await {
            total += unit?.len() as u64;
        }
        Ok(total)
    }
}

impl Stream for EntryContent {
    type Item = Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.get_mut() {
            EntryContent::Empty => Poll::Ready(None),
            EntryContent::Stream(stream) => Pin::new(stream).poll_next(cx),
        }
    }
}

impl std::fmt::Debug for EntryContent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntryContent::Empty => f.write_str("EntryContent::Empty"),
            EntryContent::Stream(s) => f
                .debug_struct("EntryContent::Stream")
                .field("buffered_bytes", &s.buffered_bytes())
                .finish(),
        }
    }
}

/// An entry yielded to the caller
///
/// The caller owns it exclusively; its content can be consumed once.
#[derive(Debug)]
pub struct ArchiveEntry {
    record: EntryRecord,
    content: EntryContent,
}

impl ArchiveEntry {
    pub(crate) fn directory(record: EntryRecord) -> Self {
        Self {
            record,
            content: EntryContent::Empty,
        }
    }

    pub(crate) fn file(record: EntryRecord, stream: ControlledStream) -> Self {
        Self {
            record,
            content: EntryContent::Stream(stream),
        }
    }

    pub fn name(&self) -> &str {
        &self.record.name
    }

    pub fn uncompressed_size(&self) -> u64 {
        self.record.uncompressed_size
    }

    pub fn is_directory(&self) -> bool {
        self.record.is_directory
    }

    pub fn record(&self) -> &EntryRecord {
        &self.record
    }

    pub fn content(&mut self) -> &mut EntryContent {
        &mut self.content
    }

    pub fn into_parts(self) -> (EntryRecord, EntryContent) {
        (self.record, self.content)
    }
}
