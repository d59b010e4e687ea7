//! Random-access reader/writer over the raw image bytes.
//!
//! The teacher wraps a generic `T: Read + Write + Seek` behind `FileSystem<T>`
//! and never cares what `T` actually is. Here there is exactly one `T` worth
//! supporting — a real file on disk, because durability and exclusive
//! locking only mean something against a real filesystem — so `ImageIO`
//! owns a `std::fs::File` directly instead of staying generic over it.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use fs2::FileExt;

use crate::error::{FatError, Result};

/// Owns the open image file handle. `Volume` is the sole owner of one
/// `ImageIO`; nothing else may seek on the same handle concurrently.
pub struct ImageIO {
    file: File,
}

impl ImageIO {
    /// Opens `path` read-write and takes an exclusive advisory lock.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        file.try_lock_exclusive().map_err(|_| FatError::Busy)?;
        Ok(ImageIO { file })
    }

    /// Reads exactly `length` bytes starting at `offset`.
    pub fn read(&mut self, offset: u64, length: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; length];
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Writes `bytes` at `offset` and forces the write durable before returning.
    pub fn write(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(bytes)?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Forces both data and metadata (file length, in particular) durable.
    pub fn flush(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    pub fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }
}

impl Drop for ImageIO {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}
