//! ZIP archive reading.
//!
//! - [`structures`]: fixed-layout records (EOCD, ZIP64 records, header constants)
//! - [`parser`]: locating and parsing the central directory from raw bytes
//! - [`reader`]: the [`ArchiveReader`](crate::archive::ArchiveReader)
//!   implementation, with streaming STORED and DEFLATE decoders
//!
//! The central directory is found from the end of the archive, so listing
//! never touches entry data. Entry content is read in bounded blocks only
//! as its stream is polled.
//!
//! ## Limitations
//!
//! - No encryption support
//! - No multi-disk archive support
//! - No BZIP2, LZMA, or other compression methods

mod parser;
mod reader;
mod structures;

pub use parser::ZipParser;
pub use reader::ZipArchiveReader;
pub use structures::*;
