//! # boundzip
//!
//! Memory-bounded streaming extraction of ZIP archives.
//!
//! An archive's entries are enumerated from its central directory and each
//! one is exposed as an incrementally consumable byte stream. The whole run
//! is governed by a single memory budget:
//!
//! - a [`MemoryMonitor`] samples process memory against the budget
//! - a [`BackpressureHandler`] pauses decoding while consumers lag behind
//! - an [`EntryFilter`] drops entries before they are opened, and its
//!   security gate rejects names that could escape a target directory
//! - a [`ChunkedProcessor`] splits content into fixed-size chunks
//! - a [`ProgressTracker`] reports rate and ETA
//!
//! ## Features
//!
//! - ZIP and ZIP64 archives, from memory or from local files
//! - STORED and DEFLATE entries, decoded incrementally with CRC-32 checks
//! - Glob include/exclude patterns, size bounds, extension and
//!   content-type allowlists
//! - Bounded parallel entry processing with memory admission control
//!
//! ## Example
//!
//! ```no_run
//! use boundzip::{ArchiveStreamExtractor, EntryFilter, ExtractOptions, FilterCriteria};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let data = tokio::fs::read("archive.zip").await?;
//!
//!     let mut options = ExtractOptions::default();
//!     options.config.memory.limit_bytes = Some(50 * 1024 * 1024);
//!     let filter = EntryFilter::new(FilterCriteria::default().include("**/*.txt"))?;
//!
//!     let extractor = ArchiveStreamExtractor::new(options.with_filter(filter))?;
//!     for mut entry in extractor.extract(data).await? {
//!         let content = entry.content().read_to_end().await?;
//!         println!("{}: {} bytes", entry.name(), content.len());
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod archive;
pub mod backpressure;
pub mod chunked;
pub mod cli;
pub mod config;
pub mod error;
pub mod extractor;
pub mod filter;
pub mod io;
pub mod memory;
pub mod progress;
pub mod zip;

pub use archive::{ArchiveEntry, ArchiveReader, ByteStream, EntryContent, EntryRecord};
pub use backpressure::{BackpressureHandler, ControlledSink, ControlledStream, DelayPolicy};
pub use chunked::{ChunkOptions, ChunkResult, ChunkedProcessor};
pub use cli::Cli;
pub use config::ExtractConfig;
pub use error::{BoxError, Error, ExtractionState, Result};
pub use extractor::{
    ArchiveStreamExtractor, EntryCallback, EntryHandler, ExtractOptions, ExtractionReport,
};
pub use filter::{EntryFilter, FilterCriteria, FilterDecision, Rejection};
pub use io::{LocalFileReader, MemoryReader, ReadAt};
pub use memory::{MemoryBudget, MemoryMonitor, MemoryProbe, MemoryStatus, ProcessMemoryProbe};
pub use progress::{ProgressSnapshot, ProgressTracker};
pub use zip::ZipArchiveReader;
