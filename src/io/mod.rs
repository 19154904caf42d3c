mod local;
mod memory;

pub use local::LocalFileReader;
pub use memory::MemoryReader;

use async_trait::async_trait;
use std::io;

/// Trait for random access reading from a data source
#[async_trait]
pub trait ReadAt: Send + Sync {
    /// Read data at the specified offset into the buffer
    ///
    /// # Arguments
    ///
    /// * `offset` - Absolute position in the source
    /// * `buf` - Destination; at most `buf.len()` bytes are read
    ///
    /// # Returns
    ///
    /// The number of bytes read. May be fewer than requested; 0 means end
    /// of source.
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;

    /// Get the total size of the data source
    fn size(&self) -> u64;

    /// Fill `buf` completely from `offset`
    ///
    /// # Errors
    ///
    /// Returns [`io::ErrorKind::UnexpectedEof`] if the source ends before
    /// `buf` is full, or the first error from [`read_at`](Self::read_at).
    async fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read_at(offset + filled as u64, &mut buf[filled..]).await?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!(
                        "wanted {} bytes at offset {}, source ended after {}",
                        buf.len(),
                        offset,
                        filled
                    ),
                ));
            }
            filled += n;
        }
        Ok(())
    }
}
