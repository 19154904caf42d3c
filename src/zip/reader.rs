//! [`ArchiveReader`] implementation for ZIP archives.

use async_trait::async_trait;
use bytes::Bytes;
use flate2::{Crc, Decompress, FlushDecompress, Status};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::archive::{ArchiveReader, ByteStream, EntryRecord};
use crate::error::{Error, Result};
use crate::io::{MemoryReader, ReadAt};

use super::parser::ZipParser;
use super::structures::{CompressionMethod, ZipFileEntry};

/// Compressed bytes requested from the source per read
const READ_BLOCK: usize = 64 * 1024;

/// Upper bound on decoded bytes emitted per stream unit
const OUTPUT_BLOCK: usize = 64 * 1024;

/// ZIP archive reader over any random-access source
///
/// The central directory is parsed once and cached; every opened entry gets
/// an independent decoding stream that reads its stored bytes lazily.
pub struct ZipArchiveReader<R: ReadAt> {
    parser: ZipParser<R>,
    entries: OnceCell<Vec<ZipFileEntry>>,
}

impl ZipArchiveReader<MemoryReader> {
    /// Reader over an in-memory archive
    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        Self::new(Arc::new(MemoryReader::new(data)))
    }
}

impl<R: ReadAt + 'static> ZipArchiveReader<R> {
    pub fn new(reader: Arc<R>) -> Self {
        Self {
            parser: ZipParser::new(reader),
            entries: OnceCell::new(),
        }
    }

    async fn entries(&self) -> Result<&[ZipFileEntry]> {
        let entries = self
            .entries
            .get_or_try_init(|| self.parser.list_files())
            .await?;
        Ok(entries.as_slice())
    }

    fn lookup<'a>(entries: &'a [ZipFileEntry], record: &EntryRecord) -> Result<&'a ZipFileEntry> {
        entries
            .get(record.index)
            .filter(|e| e.file_name == record.name)
            .ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "record {} ({}) does not belong to this archive",
                    record.index, record.name
                ))
            })
    }
}

#[async_trait]
impl<R: ReadAt + 'static> ArchiveReader for ZipArchiveReader<R> {
    async fn records(&self) -> Result<Vec<EntryRecord>> {
        Ok(self.entries().await?.iter().map(ZipFileEntry::to_record).collect())
    }

    async fn open(&self, record: &EntryRecord) -> Result<ByteStream> {
        let entries = self.entries().await?;
        let entry = Self::lookup(entries, record)?;

        if entry.is_encrypted() {
            return Err(Error::corrupt(
                "opening entry",
                "encrypted entries are not supported",
            ));
        }
        let decoder = match entry.compression_method {
            CompressionMethod::Stored => {
                if entry.compressed_size != entry.uncompressed_size {
                    return Err(Error::corrupt(
                        "opening entry",
                        format!(
                            "stored entry declares {} compressed and {} uncompressed bytes",
                            entry.compressed_size, entry.uncompressed_size
                        ),
                    ));
                }
                Decoder::Stored
            }
            CompressionMethod::Deflate => Decoder::Deflate(None),
            CompressionMethod::Unknown(method) => {
                return Err(Error::corrupt(
                    "opening entry",
                    format!("unsupported compression method {method}"),
                ));
            }
        };

        let data_offset = self.parser.get_data_offset(entry).await?;
        debug!(
            entry = %entry.file_name,
            method = entry.compression_method.as_u16(),
            data_offset,
            "opened entry"
        );

        let state = EntryDecoder {
            reader: Arc::clone(self.parser.reader()),
            name: entry.file_name.clone(),
            decoder,
            offset: data_offset,
            remaining_compressed: entry.compressed_size,
            input: Vec::new(),
            input_pos: 0,
            produced: 0,
            declared: entry.uncompressed_size,
            expected_crc: entry.crc32,
            crc: Crc::new(),
            inflate_done: false,
            finished: false,
        };

        Ok(stream::try_unfold(state, |mut state| async move {
            Ok(state.next_unit().await?.map(|unit| (unit, state)))
        })
        .boxed())
    }
}

enum Decoder {
    Stored,
    /// Inflater state is allocated on the first read
    Deflate(Option<Box<Decompress>>),
}

/// Decoding state for one entry
struct EntryDecoder<R: ReadAt> {
    reader: Arc<R>,
    name: String,
    decoder: Decoder,
    /// Next compressed byte to read from the source
    offset: u64,
    remaining_compressed: u64,
    /// Compressed bytes read but not yet fed to the inflater
    input: Vec<u8>,
    input_pos: usize,
    produced: u64,
    declared: u64,
    expected_crc: u32,
    crc: Crc,
    inflate_done: bool,
    finished: bool,
}

impl<R: ReadAt> EntryDecoder<R> {
    async fn read_block(&mut self) -> Result<Vec<u8>> {
        let len = usize::try_from(self.remaining_compressed)
            .map_or(READ_BLOCK, |remaining| remaining.min(READ_BLOCK));
        let mut buf = vec![0u8; len];
        self.reader
            .read_exact_at(self.offset, &mut buf)
            .await
            .map_err(|e| Error::stream(format!("reading {}", self.name), e))?;
        self.offset += len as u64;
        self.remaining_compressed -= len as u64;
        Ok(buf)
    }

    async fn next_unit(&mut self) -> Result<Option<Bytes>> {
        if self.finished {
            return Ok(None);
        }

        let unit = if matches!(self.decoder, Decoder::Stored) {
            if self.remaining_compressed == 0 {
                None
            } else {
                Some(self.read_block().await?)
            }
        } else {
            self.inflate_unit().await?
        };

        match unit {
            Some(unit) => {
                self.produced += unit.len() as u64;
                if self.produced > self.declared {
                    return Err(Error::corrupt(
                        format!("decoding {}", self.name),
                        format!("content exceeds declared size of {} bytes", self.declared),
                    ));
                }
                self.crc.update(&unit);
                Ok(Some(Bytes::from(unit)))
            }
            None => {
                self.finished = true;
                self.verify()?;
                Ok(None)
            }
        }
    }

    async fn inflate_unit(&mut self) -> Result<Option<Vec<u8>>> {
        if self.inflate_done {
            return Ok(None);
        }
        let mut out = vec![0u8; OUTPUT_BLOCK];
        loop {
            if self.input_pos == self.input.len() && self.remaining_compressed > 0 {
                self.input = self.read_block().await?;
                self.input_pos = 0;
            }

            let Decoder::Deflate(slot) = &mut self.decoder else {
                return Ok(None);
            };
            let inflater = slot.get_or_insert_with(|| Box::new(Decompress::new(false)));
            let before_in = inflater.total_in();
            let before_out = inflater.total_out();
            let status = inflater
                .decompress(&self.input[self.input_pos..], &mut out, FlushDecompress::None)
                .map_err(|e| {
                    Error::stream(
                        format!("inflating {}", self.name),
                        std::io::Error::new(std::io::ErrorKind::InvalidData, e),
                    )
                })?;
            let consumed = (inflater.total_in() - before_in) as usize;
            let written = (inflater.total_out() - before_out) as usize;
            self.input_pos += consumed;
            if status == Status::StreamEnd {
                self.inflate_done = true;
            }

            if written > 0 {
                out.truncate(written);
                return Ok(Some(out));
            }
            if self.inflate_done {
                return Ok(None);
            }
            if consumed == 0 {
                let exhausted =
                    self.remaining_compressed == 0 && self.input_pos == self.input.len();
                let detail = if exhausted {
                    "compressed data ended before the deflate stream did"
                } else {
                    "deflate stream made no progress"
                };
                return Err(Error::corrupt(format!("inflating {}", self.name), detail));
            }
        }
    }

    fn verify(&self) -> Result<()> {
        if self.produced != self.declared {
            return Err(Error::corrupt(
                format!("decoding {}", self.name),
                format!(
                    "expected {} bytes, content ended after {}",
                    self.declared, self.produced
                ),
            ));
        }
        if self.crc.sum() != self.expected_crc {
            return Err(Error::corrupt(
                format!("decoding {}", self.name),
                format!(
                    "CRC-32 mismatch: expected {:08x}, got {:08x}",
                    self.expected_crc,
                    self.crc.sum()
                ),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn build_zip(files: &[(&str, &[u8], zip::CompressionMethod)]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
        for (name, content, method) in files {
            let options = zip::write::FileOptions::default().compression_method(*method);
            writer.start_file(*name, options).unwrap();
            writer.write_all(content).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    async fn read_all(reader: &ZipArchiveReader<MemoryReader>, record: &EntryRecord) -> Result<Vec<u8>> {
        let mut stream = reader.open(record).await?;
        let mut out = Vec::new();
        while let Some(unit) = stream.next().await {
            out.extend_from_slice(&unit?);
        }
        Ok(out)
    }

    #[tokio::test]
    async fn test_stored_and_deflated_entries_decode() {
        let text: Vec<u8> = b"the quick brown fox ".repeat(10_000);
        let data = build_zip(&[
            ("plain.txt", b"hello", zip::CompressionMethod::Stored),
            ("fox.txt", &text, zip::CompressionMethod::Deflated),
        ]);
        let reader = ZipArchiveReader::from_bytes(data);

        let records = reader.records().await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].uncompressed_size, text.len() as u64);
        assert!(records[1].compressed_size < records[1].uncompressed_size);

        assert_eq!(read_all(&reader, &records[0]).await.unwrap(), b"hello");
        assert_eq!(read_all(&reader, &records[1]).await.unwrap(), text);
    }

    #[tokio::test]
    async fn test_deflate_units_are_bounded() {
        let text = vec![b'a'; 1_000_000];
        let data = build_zip(&[("a.bin", &text, zip::CompressionMethod::Deflated)]);
        let reader = ZipArchiveReader::from_bytes(data);
        let records = reader.records().await.unwrap();

        let mut stream = reader.open(&records[0]).await.unwrap();
        let mut total = 0;
        while let Some(unit) = stream.next().await {
            let unit = unit.unwrap();
            assert!(unit.len() <= OUTPUT_BLOCK);
            total += unit.len();
        }
        assert_eq!(total, text.len());
    }

    #[tokio::test]
    async fn test_single_compressed_block_expands_past_output_block() {
        let text = vec![b'a'; 200_000];
        let data = build_zip(&[("run.bin", &text, zip::CompressionMethod::Deflated)]);
        let reader = ZipArchiveReader::from_bytes(data);
        let records = reader.records().await.unwrap();
        assert!(records[0].compressed_size < READ_BLOCK as u64);

        assert_eq!(read_all(&reader, &records[0]).await.unwrap(), text);
    }

    #[tokio::test]
    async fn test_truncated_deflate_data_is_rejected() {
        let text: Vec<u8> = b"the quick brown fox ".repeat(10_000);
        let mut data = build_zip(&[("fox.txt", &text, zip::CompressionMethod::Deflated)]);
        let cdfh = data.windows(4).rposition(|w| w == b"PK\x01\x02").unwrap();
        let size_at = cdfh + 20;
        let compressed = u32::from_le_bytes(data[size_at..size_at + 4].try_into().unwrap());
        data[size_at..size_at + 4].copy_from_slice(&(compressed / 2).to_le_bytes());

        let reader = ZipArchiveReader::from_bytes(data);
        let records = reader.records().await.unwrap();
        assert!(matches!(
            read_all(&reader, &records[0]).await,
            Err(Error::Stream { .. })
        ));
    }

    /// Single stored entry whose sizes and offset live only in ZIP64 fields
    fn zip64_archive(name: &str, content: &[u8]) -> Vec<u8> {
        use byteorder::{LittleEndian, WriteBytesExt};

        let mut crc = Crc::new();
        crc.update(content);
        let size = content.len() as u64;
        let mut out = Vec::new();

        out.extend_from_slice(b"PK\x03\x04");
        out.write_u16::<LittleEndian>(45).unwrap();
        out.write_u16::<LittleEndian>(0).unwrap();
        out.write_u16::<LittleEndian>(0).unwrap();
        out.write_u32::<LittleEndian>(0).unwrap();
        out.write_u32::<LittleEndian>(crc.sum()).unwrap();
        out.write_u32::<LittleEndian>(0xFFFFFFFF).unwrap();
        out.write_u32::<LittleEndian>(0xFFFFFFFF).unwrap();
        out.write_u16::<LittleEndian>(name.len() as u16).unwrap();
        out.write_u16::<LittleEndian>(20).unwrap();
        out.extend_from_slice(name.as_bytes());
        out.write_u16::<LittleEndian>(0x0001).unwrap();
        out.write_u16::<LittleEndian>(16).unwrap();
        out.write_u64::<LittleEndian>(size).unwrap();
        out.write_u64::<LittleEndian>(size).unwrap();
        out.extend_from_slice(content);

        let cd_offset = out.len() as u64;
        out.extend_from_slice(b"PK\x01\x02");
        out.write_u16::<LittleEndian>(45).unwrap();
        out.write_u16::<LittleEndian>(45).unwrap();
        out.write_u16::<LittleEndian>(0).unwrap();
        out.write_u16::<LittleEndian>(0).unwrap();
        out.write_u32::<LittleEndian>(0).unwrap();
        out.write_u32::<LittleEndian>(crc.sum()).unwrap();
        out.write_u32::<LittleEndian>(0xFFFFFFFF).unwrap();
        out.write_u32::<LittleEndian>(0xFFFFFFFF).unwrap();
        out.write_u16::<LittleEndian>(name.len() as u16).unwrap();
        out.write_u16::<LittleEndian>(28).unwrap();
        out.write_u16::<LittleEndian>(0).unwrap();
        out.write_u16::<LittleEndian>(0).unwrap();
        out.write_u16::<LittleEndian>(0).unwrap();
        out.write_u32::<LittleEndian>(0).unwrap();
        out.write_u32::<LittleEndian>(0xFFFFFFFF).unwrap();
        out.extend_from_slice(name.as_bytes());
        out.write_u16::<LittleEndian>(0x0001).unwrap();
        out.write_u16::<LittleEndian>(24).unwrap();
        out.write_u64::<LittleEndian>(size).unwrap();
        out.write_u64::<LittleEndian>(size).unwrap();
        out.write_u64::<LittleEndian>(0).unwrap();
        let cd_size = out.len() as u64 - cd_offset;

        let eocd64_offset = out.len() as u64;
        out.extend_from_slice(b"PK\x06\x06");
        out.write_u64::<LittleEndian>(44).unwrap();
        out.write_u16::<LittleEndian>(45).unwrap();
        out.write_u16::<LittleEndian>(45).unwrap();
        out.write_u32::<LittleEndian>(0).unwrap();
        out.write_u32::<LittleEndian>(0).unwrap();
        out.write_u64::<LittleEndian>(1).unwrap();
        out.write_u64::<LittleEndian>(1).unwrap();
        out.write_u64::<LittleEndian>(cd_size).unwrap();
        out.write_u64::<LittleEndian>(cd_offset).unwrap();

        out.extend_from_slice(b"PK\x06\x07");
        out.write_u32::<LittleEndian>(0).unwrap();
        out.write_u64::<LittleEndian>(eocd64_offset).unwrap();
        out.write_u32::<LittleEndian>(1).unwrap();

        out.extend_from_slice(b"PK\x05\x06");
        out.write_u16::<LittleEndian>(0).unwrap();
        out.write_u16::<LittleEndian>(0).unwrap();
        out.write_u16::<LittleEndian>(0xFFFF).unwrap();
        out.write_u16::<LittleEndian>(0xFFFF).unwrap();
        out.write_u32::<LittleEndian>(0xFFFFFFFF).unwrap();
        out.write_u32::<LittleEndian>(0xFFFFFFFF).unwrap();
        out.write_u16::<LittleEndian>(0).unwrap();
        out
    }

    #[tokio::test]
    async fn test_zip64_records_use_extended_fields() {
        let content = b"sizes and offsets from the ZIP64 extra field";
        let reader = ZipArchiveReader::from_bytes(zip64_archive("big/part.bin", content));

        let records = reader.records().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name, "big/part.bin");
        assert_eq!(records[0].uncompressed_size, content.len() as u64);
        assert_eq!(records[0].compressed_size, content.len() as u64);
        assert_eq!(read_all(&reader, &records[0]).await.unwrap(), content);
    }

    #[tokio::test]
    async fn test_corrupted_content_fails_crc() {
        let mut data = build_zip(&[("a.txt", b"0123456789", zip::CompressionMethod::Stored)]);
        let at = data.windows(10).position(|w| w == b"0123456789").unwrap();
        data[at] ^= 0xFF;
        let reader = ZipArchiveReader::from_bytes(data);
        let records = reader.records().await.unwrap();

        let err = read_all(&reader, &records[0]).await.unwrap_err();
        assert!(matches!(err, Error::Stream { .. }));
        assert!(format!("{:?}", err).contains("CRC-32"));
    }

    #[tokio::test]
    async fn test_not_a_zip() {
        let reader = ZipArchiveReader::from_bytes(vec![7u8; 4096]);
        assert!(matches!(
            reader.records().await,
            Err(Error::ArchiveOpen { .. })
        ));
    }

    #[tokio::test]
    async fn test_archive_with_comment() {
        let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
        writer.set_comment("built for tests");
        writer
            .start_file("x", zip::write::FileOptions::default())
            .unwrap();
        writer.write_all(b"x").unwrap();
        let data = writer.finish().unwrap().into_inner();

        let reader = ZipArchiveReader::from_bytes(data);
        let records = reader.records().await.unwrap();
        assert_eq!(records[0].name, "x");
    }

    #[tokio::test]
    async fn test_foreign_record_is_rejected() {
        let data = build_zip(&[("a", b"a", zip::CompressionMethod::Stored)]);
        let reader = ZipArchiveReader::from_bytes(data);
        let stranger = EntryRecord::new("b", 1, false);
        assert!(matches!(
            reader.open(&stranger).await,
            Err(Error::InvalidArgument(_))
        ));
    }
}
