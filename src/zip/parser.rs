//! Low-level ZIP archive parser.
//!
//! ZIP files are read from the end:
//! 1. Find the End of Central Directory (EOCD) at the file's end
//! 2. If ZIP64, read the ZIP64 EOCD for large file support
//! 3. Read the Central Directory to get metadata for all files
//! 4. For extraction, read each file's Local File Header to find its data

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{Cursor, Read};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::io::ReadAt;

use super::structures::*;

/// Maximum ZIP comment size allowed by the format (65535 bytes).
///
/// This limits the search area when looking for EOCD with a comment.
const MAX_COMMENT_SIZE: u64 = 65535;

/// Low-level ZIP file parser, generic over the byte source
pub struct ZipParser<R: ReadAt> {
    reader: Arc<R>,
    size: u64,
}

impl<R: ReadAt> ZipParser<R> {
    /// Create a new parser for the given reader.
    ///
    /// # Arguments
    ///
    /// * `reader` - A shared reference to a reader implementing [`ReadAt`]
    ///
    /// # Returns
    ///
    /// A new parser instance ready to read the archive.
    pub fn new(reader: Arc<R>) -> Self {
        let size = reader.size();
        Self { reader, size }
    }

    async fn read_exact(&self, offset: u64, buf: &mut [u8], what: &str) -> Result<()> {
        self.reader
            .read_exact_at(offset, buf)
            .await
            .map_err(|e| Error::archive_open_io(format!("failed to read {what}"), e))
    }

    /// Find and parse the End of Central Directory record.
    ///
    /// Tries the no-comment layout first, then searches backwards over the
    /// largest comment the format allows.
    ///
    /// # Returns
    ///
    /// A tuple of (EOCD record, offset of EOCD in file).
    ///
    /// # Errors
    ///
    /// Returns [`Error::ArchiveOpen`] if the input is too small or no
    /// record with a consistent comment length is found.
    pub async fn find_eocd(&self) -> Result<(EndOfCentralDirectory, u64)> {
        if self.size < EndOfCentralDirectory::SIZE as u64 {
            return Err(Error::archive_open("input too small to be a ZIP archive"));
        }

        // Common case first: no archive comment
        let offset = self.size - EndOfCentralDirectory::SIZE as u64;
        let mut buf = vec![0u8; EndOfCentralDirectory::SIZE];
        self.read_exact(offset, &mut buf, "end of central directory")
            .await?;
        if &buf[0..4] == EndOfCentralDirectory::SIGNATURE && &buf[20..22] == b"\x00\x00" {
            let eocd = EndOfCentralDirectory::from_bytes(&buf)?;
            return Ok((eocd, offset));
        }

        // Otherwise search backwards over the largest possible comment
        let search_size = (MAX_COMMENT_SIZE + EndOfCentralDirectory::SIZE as u64).min(self.size);
        let search_start = self.size - search_size;

        let mut buf = vec![0u8; search_size as usize];
        self.read_exact(search_start, &mut buf, "archive tail").await?;

        for i in (0..=buf.len() - EndOfCentralDirectory::SIZE).rev() {
            if &buf[i..i + 4] == EndOfCentralDirectory::SIGNATURE {
                // the comment length must account for exactly the remaining bytes
                let comment_len = u16::from_le_bytes([buf[i + 20], buf[i + 21]]) as usize;
                if comment_len == buf.len() - i - EndOfCentralDirectory::SIZE {
                    let eocd = EndOfCentralDirectory::from_bytes(
                        &buf[i..i + EndOfCentralDirectory::SIZE],
                    )?;
                    return Ok((eocd, search_start + i as u64));
                }
            }
        }

        Err(Error::archive_open("not a valid ZIP file"))
    }

    /// Read the ZIP64 End of Central Directory record, located through the
    /// locator that sits immediately before the regular EOCD.
    ///
    /// # Arguments
    ///
    /// * `eocd_offset` - Offset of the regular EOCD in the file
    ///
    /// # Returns
    ///
    /// The parsed ZIP64 EOCD with 64-bit field values.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ArchiveOpen`] if the locator or the record is
    /// missing or invalid.
    pub async fn read_zip64_eocd(&self, eocd_offset: u64) -> Result<Zip64EOCD> {
        let locator_offset = eocd_offset
            .checked_sub(Zip64EOCDLocator::SIZE as u64)
            .ok_or_else(|| Error::archive_open("missing ZIP64 locator"))?;
        let mut locator_buf = vec![0u8; Zip64EOCDLocator::SIZE];
        self.read_exact(locator_offset, &mut locator_buf, "ZIP64 locator")
            .await?;
        let locator = Zip64EOCDLocator::from_bytes(&locator_buf)?;

        let mut eocd64_buf = vec![0u8; Zip64EOCD::MIN_SIZE];
        self.read_exact(
            locator.eocd64_offset,
            &mut eocd64_buf,
            "ZIP64 end of central directory",
        )
        .await?;

        Zip64EOCD::from_bytes(&eocd64_buf)
    }

    /// List every record in the Central Directory.
    ///
    /// # Returns
    ///
    /// One [`ZipFileEntry`] per file or directory, in directory order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ArchiveOpen`] for multi-disk archives, a central
    /// directory outside the archive, an entry count it cannot hold, or a
    /// malformed record.
    pub async fn list_files(&self) -> Result<Vec<ZipFileEntry>> {
        let (eocd, eocd_offset) = self.find_eocd().await?;
        if eocd.is_multi_disk() {
            return Err(Error::archive_open("multi-disk archives are not supported"));
        }

        let (cd_offset, cd_size, total_entries) = if eocd.is_zip64() {
            let eocd64 = self.read_zip64_eocd(eocd_offset).await?;
            (eocd64.cd_offset, eocd64.cd_size, eocd64.total_entries)
        } else {
            (
                eocd.cd_offset as u64,
                eocd.cd_size as u64,
                eocd.total_entries as u64,
            )
        };

        let cd_end = cd_offset
            .checked_add(cd_size)
            .filter(|end| *end <= eocd_offset)
            .ok_or_else(|| Error::archive_open("central directory lies outside the archive"))?;
        // every record is at least CDFH_MIN_SIZE bytes, so this bounds the
        // allocation below by the central directory size
        if total_entries > cd_size / CDFH_MIN_SIZE as u64 {
            return Err(Error::archive_open(format!(
                "central directory of {cd_size} bytes cannot hold {total_entries} entries"
            )));
        }

        let mut cd_data = vec![0u8; (cd_end - cd_offset) as usize];
        self.read_exact(cd_offset, &mut cd_data, "central directory")
            .await?;

        let mut entries = Vec::with_capacity(total_entries as usize);
        let mut cursor = Cursor::new(cd_data.as_slice());
        for index in 0..total_entries as usize {
            entries.push(parse_cdfh(&mut cursor, index)?);
        }

        Ok(entries)
    }

    /// Validate the Local File Header of `entry` and return the offset where
    /// its stored data begins.
    ///
    /// # Arguments
    ///
    /// * `entry` - The file entry from [`list_files()`](Self::list_files)
    ///
    /// # Returns
    ///
    /// The byte offset where the stored file data begins.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Stream`] if the header cannot be read, has a bad
    /// signature, or the data would run past the end of the archive.
    pub async fn get_data_offset(&self, entry: &ZipFileEntry) -> Result<u64> {
        let mut lfh_buf = vec![0u8; LFH_SIZE];
        self.reader
            .read_exact_at(entry.lfh_offset, &mut lfh_buf)
            .await
            .map_err(|e| Error::stream("reading local file header", e))?;

        if &lfh_buf[0..4] != LFH_SIGNATURE {
            return Err(Error::corrupt(
                "reading local file header",
                format!("bad signature at offset {}", entry.lfh_offset),
            ));
        }

        // filename and extra field lengths live at fixed positions
        let file_name_length = u16::from_le_bytes([lfh_buf[26], lfh_buf[27]]) as u64;
        let extra_field_length = u16::from_le_bytes([lfh_buf[28], lfh_buf[29]]) as u64;

        let data_offset =
            entry.lfh_offset + LFH_SIZE as u64 + file_name_length + extra_field_length;
        let data_end = data_offset.checked_add(entry.compressed_size);
        if data_end.is_none_or(|end| end > self.size) {
            return Err(Error::corrupt(
                "locating entry data",
                format!("{} bytes at offset {} run past the archive", entry.compressed_size, data_offset),
            ));
        }

        Ok(data_offset)
    }

    /// The byte source shared with every opened entry
    pub fn reader(&self) -> &Arc<R> {
        &self.reader
    }
}

fn truncated(_: std::io::Error) -> Error {
    Error::archive_open("truncated central directory record")
}

/// Parse one Central Directory File Header.
///
/// ZIP64 extra fields replace the sizes and offset that are saturated at
/// `0xFFFFFFFF` in the fixed header.
///
/// # Arguments
///
/// * `cursor` - A cursor positioned at the start of a CDFH
/// * `index` - Position of the record in the central directory
///
/// # Errors
///
/// Returns [`Error::ArchiveOpen`] if the signature is wrong or the record
/// is truncated.
fn parse_cdfh(cursor: &mut Cursor<&[u8]>, index: usize) -> Result<ZipFileEntry> {
    let mut sig = [0u8; 4];
    cursor.read_exact(&mut sig).map_err(truncated)?;
    if sig != CDFH_SIGNATURE {
        return Err(Error::archive_open(format!(
            "invalid central directory header for entry {index}"
        )));
    }

    let _version_made_by = cursor.read_u16::<LittleEndian>().map_err(truncated)?;
    let _version_needed = cursor.read_u16::<LittleEndian>().map_err(truncated)?;
    let flags = cursor.read_u16::<LittleEndian>().map_err(truncated)?;
    let compression_method = cursor.read_u16::<LittleEndian>().map_err(truncated)?;
    let _last_mod_time = cursor.read_u16::<LittleEndian>().map_err(truncated)?;
    let _last_mod_date = cursor.read_u16::<LittleEndian>().map_err(truncated)?;
    let crc32 = cursor.read_u32::<LittleEndian>().map_err(truncated)?;
    let mut compressed_size = cursor.read_u32::<LittleEndian>().map_err(truncated)? as u64;
    let mut uncompressed_size = cursor.read_u32::<LittleEndian>().map_err(truncated)? as u64;
    let file_name_length = cursor.read_u16::<LittleEndian>().map_err(truncated)?;
    let extra_field_length = cursor.read_u16::<LittleEndian>().map_err(truncated)?;
    let file_comment_length = cursor.read_u16::<LittleEndian>().map_err(truncated)?;
    let _disk_number_start = cursor.read_u16::<LittleEndian>().map_err(truncated)?;
    let _internal_attrs = cursor.read_u16::<LittleEndian>().map_err(truncated)?;
    let _external_attrs = cursor.read_u32::<LittleEndian>().map_err(truncated)?;
    let mut lfh_offset = cursor.read_u32::<LittleEndian>().map_err(truncated)? as u64;

    let mut file_name_bytes = vec![0u8; file_name_length as usize];
    cursor.read_exact(&mut file_name_bytes).map_err(truncated)?;
    // names that are not UTF-8 are decoded lossily; the security gate sees
    // the replacement characters
    let file_name = String::from_utf8_lossy(&file_name_bytes).into_owned();
    let is_directory = file_name.ends_with('/');

    let extra_field_end = cursor.position() + extra_field_length as u64;
    if extra_field_end > cursor.get_ref().len() as u64 {
        return Err(truncated(std::io::ErrorKind::UnexpectedEof.into()));
    }

    while cursor.position() + 4 <= extra_field_end {
        let header_id = cursor.read_u16::<LittleEndian>().map_err(truncated)?;
        let field_size = cursor.read_u16::<LittleEndian>().map_err(truncated)?;
        let field_end = (cursor.position() + field_size as u64).min(extra_field_end);

        if header_id == 0x0001 {
            // ZIP64 values appear only for header fields saturated at 0xFFFFFFFF
            if uncompressed_size == 0xFFFFFFFF && cursor.position() + 8 <= field_end {
                uncompressed_size = cursor.read_u64::<LittleEndian>().map_err(truncated)?;
            }
            if compressed_size == 0xFFFFFFFF && cursor.position() + 8 <= field_end {
                compressed_size = cursor.read_u64::<LittleEndian>().map_err(truncated)?;
            }
            if lfh_offset == 0xFFFFFFFF && cursor.position() + 8 <= field_end {
                lfh_offset = cursor.read_u64::<LittleEndian>().map_err(truncated)?;
            }
        }
        cursor.set_position(field_end);
    }

    cursor.set_position(extra_field_end + file_comment_length as u64);

    Ok(ZipFileEntry {
        index,
        file_name,
        flags,
        compression_method: CompressionMethod::from_u16(compression_method),
        compressed_size,
        uncompressed_size,
        crc32,
        lfh_offset,
        is_directory,
    })
}
