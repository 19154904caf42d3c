use async_trait::async_trait;
use bytes::Bytes;
use std::io;

use super::ReadAt;

/// In-memory archive source
///
/// Cloning the underlying [`Bytes`] is cheap, so one archive buffer can back
/// many concurrent entry readers.
#[derive(Debug, Clone)]
pub struct MemoryReader {
    data: Bytes,
}

impl MemoryReader {
    /// Wrap an archive buffer.
    ///
    /// # Arguments
    ///
    /// * `data` - The whole archive; anything convertible into [`Bytes`]
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }
}

#[async_trait]
impl ReadAt for MemoryReader {
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let len = self.data.len() as u64;
        if offset >= len || buf.is_empty() {
            return Ok(0);
        }
        let start = offset as usize;
        let n = buf.len().min(self.data.len() - start);
        buf[..n].copy_from_slice(&self.data[start..start + n]);
        Ok(n)
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }
}
