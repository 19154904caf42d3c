use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

use crate::archive::EntryRecord;
use crate::error::{Error, Result};

/// ZIP compression methods
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionMethod {
    Stored,
    Deflate,
    Unknown(u16),
}

impl CompressionMethod {
    /// Map the method field of a header; anything but 0 and 8 is kept as
    /// [`CompressionMethod::Unknown`]
    pub fn from_u16(value: u16) -> Self {
        match value {
            0 => CompressionMethod::Stored,
            8 => CompressionMethod::Deflate,
            _ => CompressionMethod::Unknown(value),
        }
    }

    pub fn as_u16(&self) -> u16 {
        match self {
            CompressionMethod::Stored => 0,
            CompressionMethod::Deflate => 8,
            CompressionMethod::Unknown(v) => *v,
        }
    }
}

fn short_record(what: &str) -> Error {
    Error::archive_open(format!("truncated {what}"))
}

/// End of Central Directory (EOCD) - 22 bytes minimum
pub struct EndOfCentralDirectory {
    pub disk_number: u16,
    pub disk_with_cd: u16,
    pub disk_entries: u16,
    pub total_entries: u16,
    pub cd_size: u32,
    pub cd_offset: u32,
    pub comment_len: u16,
}

impl EndOfCentralDirectory {
    pub const SIGNATURE: &'static [u8] = b"PK\x05\x06";
    pub const SIZE: usize = 22;

    /// Parse an EOCD record.
    ///
    /// # Arguments
    ///
    /// * `data` - At least [`Self::SIZE`] bytes starting at the signature
    ///
    /// # Errors
    ///
    /// Returns [`Error::ArchiveOpen`] if the signature is missing or the
    /// record is truncated.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE || &data[0..4] != Self::SIGNATURE {
            return Err(Error::archive_open("invalid end of central directory"));
        }

        let mut cursor = Cursor::new(&data[4..]);
        let short = |_| short_record("end of central directory");

        Ok(Self {
            disk_number: cursor.read_u16::<LittleEndian>().map_err(short)?,
            disk_with_cd: cursor.read_u16::<LittleEndian>().map_err(short)?,
            disk_entries: cursor.read_u16::<LittleEndian>().map_err(short)?,
            total_entries: cursor.read_u16::<LittleEndian>().map_err(short)?,
            cd_size: cursor.read_u32::<LittleEndian>().map_err(short)?,
            cd_offset: cursor.read_u32::<LittleEndian>().map_err(short)?,
            comment_len: cursor.read_u16::<LittleEndian>().map_err(short)?,
        })
    }

    /// Whether any field is saturated, meaning the real values live in the
    /// ZIP64 record
    pub fn is_zip64(&self) -> bool {
        self.disk_entries == 0xFFFF
            || self.total_entries == 0xFFFF
            || self.cd_size == 0xFFFFFFFF
            || self.cd_offset == 0xFFFFFFFF
    }

    pub fn is_multi_disk(&self) -> bool {
        self.disk_number != 0 || self.disk_with_cd != 0
    }
}

/// ZIP64 End of Central Directory Locator - 20 bytes
pub struct Zip64EOCDLocator {
    pub disk_with_eocd64: u32,
    pub eocd64_offset: u64,
    pub total_disks: u32,
}

impl Zip64EOCDLocator {
    pub const SIGNATURE: &'static [u8] = b"PK\x06\x07";
    pub const SIZE: usize = 20;

    /// Parse a ZIP64 locator.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ArchiveOpen`] if the signature is missing or the
    /// locator is truncated.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE || &data[0..4] != Self::SIGNATURE {
            return Err(Error::archive_open("invalid ZIP64 locator"));
        }

        let mut cursor = Cursor::new(&data[4..]);
        let short = |_| short_record("ZIP64 locator");

        Ok(Self {
            disk_with_eocd64: cursor.read_u32::<LittleEndian>().map_err(short)?,
            eocd64_offset: cursor.read_u64::<LittleEndian>().map_err(short)?,
            total_disks: cursor.read_u32::<LittleEndian>().map_err(short)?,
        })
    }
}

/// ZIP64 End of Central Directory - 56 bytes minimum
pub struct Zip64EOCD {
    pub total_entries: u64,
    pub cd_size: u64,
    pub cd_offset: u64,
}

impl Zip64EOCD {
    pub const SIGNATURE: &'static [u8] = b"PK\x06\x06";
    pub const MIN_SIZE: usize = 56;

    /// Parse the fixed part of a ZIP64 EOCD record.
    ///
    /// # Arguments
    ///
    /// * `data` - At least [`Self::MIN_SIZE`] bytes starting at the signature
    ///
    /// # Returns
    ///
    /// The entry count and central directory location as 64-bit values.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ArchiveOpen`] if the signature is missing or the
    /// record is truncated.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::MIN_SIZE || &data[0..4] != Self::SIGNATURE {
            return Err(Error::archive_open("invalid ZIP64 end of central directory"));
        }

        // record size, versions and disk numbers precede the counts
        let mut cursor = Cursor::new(&data[24..]);
        let short = |_| short_record("ZIP64 end of central directory");

        let _disk_entries = cursor.read_u64::<LittleEndian>().map_err(short)?;
        Ok(Self {
            total_entries: cursor.read_u64::<LittleEndian>().map_err(short)?,
            cd_size: cursor.read_u64::<LittleEndian>().map_err(short)?,
            cd_offset: cursor.read_u64::<LittleEndian>().map_err(short)?,
        })
    }
}

/// Central Directory File Header (CDFH) - 46 bytes minimum
pub const CDFH_SIGNATURE: &[u8] = b"PK\x01\x02";
pub const CDFH_MIN_SIZE: usize = 46;

/// Local File Header (LFH) - 30 bytes
pub const LFH_SIGNATURE: &[u8] = b"PK\x03\x04";
pub const LFH_SIZE: usize = 30;

/// General purpose flag bit 0: entry is encrypted
pub const FLAG_ENCRYPTED: u16 = 0x0001;

/// Parsed central directory record
#[derive(Debug, Clone)]
pub struct ZipFileEntry {
    pub index: usize,
    pub file_name: String,
    pub flags: u16,
    pub compression_method: CompressionMethod,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub crc32: u32,
    pub lfh_offset: u64,
    pub is_directory: bool,
}

impl ZipFileEntry {
    pub fn is_encrypted(&self) -> bool {
        self.flags & FLAG_ENCRYPTED != 0
    }

    /// Format-neutral view of this entry
    ///
    /// # Returns
    ///
    /// An [`EntryRecord`] carrying the directory index, name and sizes.
    pub fn to_record(&self) -> EntryRecord {
        EntryRecord {
            index: self.index,
            name: self.file_name.clone(),
            uncompressed_size: self.uncompressed_size,
            compressed_size: self.compressed_size,
            is_directory: self.is_directory,
        }
    }
}
