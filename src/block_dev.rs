use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::{Error, Result};

/// Fixed-geometry block storage. Block indices are absolute and every
/// transfer covers whole blocks.
pub trait BlockDevice: Send + Sync {
    /// Returns the size of each block in bytes.
    fn block_size(&self) -> usize;

    /// Returns the number of blocks in the block device.
    fn num_blocks(&self) -> usize;

    /// Reads `count` blocks starting at `start` into `buf`.
    /// buf.len() must be equal to count * block_size().
    fn read_blocks(&self, start: usize, count: usize, buf: &mut [u8]) -> Result<()>;

    /// Writes `count` blocks starting at `start` from `buf`.
    /// buf.len() must be equal to count * block_size().
    fn write_blocks(&self, start: usize, count: usize, buf: &[u8]) -> Result<()>;

    /// Flushes any buffered data to the underlying storage.
    fn flush(&self) -> Result<()>;

    fn read_block(&self, block_id: usize, buf: &mut [u8]) -> Result<()> {
        self.read_blocks(block_id, 1, buf)
    }

    fn write_block(&self, block_id: usize, buf: &[u8]) -> Result<()> {
        self.write_blocks(block_id, 1, buf)
    }
}

/// Checks a transfer against the device bounds, returning its byte range.
fn byte_range(dev: &impl BlockDevice, start: usize, count: usize, len: usize) -> Result<(u64, usize)> {
    let end = start.checked_add(count).ok_or(Error::OutOfBounds)?;
    if end > dev.num_blocks() || len != count * dev.block_size() {
        return Err(Error::OutOfBounds);
    }
    Ok(((start * dev.block_size()) as u64, len))
}

/// In-memory block device. Clones share the same storage, so a volume can be
/// dropped and mounted again from a clone.
#[derive(Debug, Clone)]
pub struct RamDisk {
    inner: Arc<Mutex<Vec<u8>>>,
    block_size: usize,
    num_blocks: usize,
}

impl RamDisk {
    /// Creates a zero-filled disk of `num_blocks` blocks of `block_size` bytes.
    pub fn new(block_size: usize, num_blocks: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(vec![0u8; block_size * num_blocks])),
            block_size,
            num_blocks,
        }
    }
}

impl BlockDevice for RamDisk {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn num_blocks(&self) -> usize {
        self.num_blocks
    }

    fn read_blocks(&self, start: usize, count: usize, buf: &mut [u8]) -> Result<()> {
        let (offset, len) = byte_range(self, start, count, buf.len())?;
        let offset = offset as usize;
        let data = self.inner.lock();
        buf.copy_from_slice(&data[offset..offset + len]);
        Ok(())
    }

    fn write_blocks(&self, start: usize, count: usize, buf: &[u8]) -> Result<()> {
        let (offset, len) = byte_range(self, start, count, buf.len())?;
        let offset = offset as usize;
        let mut data = self.inner.lock();
        data[offset..offset + len].copy_from_slice(buf);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Disk image backed by a regular file, using positional I/O.
#[derive(Debug)]
pub struct FileDisk {
    file: File,
    block_size: usize,
    num_blocks: usize,
}

impl FileDisk {
    /// Creates (or truncates) a zero-filled image at `path`.
    pub fn format(path: impl AsRef<Path>, block_size: usize, num_blocks: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        file.set_len((block_size * num_blocks) as u64)?;
        debug!(path = %path.as_ref().display(), block_size, num_blocks, "disk image created");
        Ok(Self { file, block_size, num_blocks })
    }

    /// Opens an existing image whose length must match the given geometry.
    pub fn mount(path: impl AsRef<Path>, block_size: usize, num_blocks: usize) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path.as_ref())?;
        let len = file.metadata()?.len();
        if len != (block_size * num_blocks) as u64 {
            return Err(Error::Geometry(format!(
                "image is {len} bytes, expected {num_blocks} blocks of {block_size}"
            )));
        }
        debug!(path = %path.as_ref().display(), block_size, num_blocks, "disk image opened");
        Ok(Self { file, block_size, num_blocks })
    }
}

impl BlockDevice for FileDisk {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn num_blocks(&self) -> usize {
        self.num_blocks
    }

    fn read_blocks(&self, start: usize, count: usize, buf: &mut [u8]) -> Result<()> {
        let (offset, _) = byte_range(self, start, count, buf.len())?;
        trace!(start, count, "image read");
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_blocks(&self, start: usize, count: usize, buf: &[u8]) -> Result<()> {
        let (offset, _) = byte_range(self, start, count, buf.len())?;
        trace!(start, count, "image write");
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_ram_disk_bounds() {
        let rd = RamDisk::new(128, 4);
        let mut buf = vec![0u8; 256];
        assert!(rd.read_blocks(3, 2, &mut buf).is_err());
        assert!(rd.read_blocks(2, 1, &mut buf).is_err());
        let data = vec![7u8; 256];
        rd.write_blocks(2, 2, &data).unwrap();
        rd.read_blocks(2, 2, &mut buf).unwrap();
        assert_eq!(buf, data);
    }

    #[test]
    fn test_ram_disk_clone_shares_storage() {
        let rd = RamDisk::new(128, 2);
        let other = rd.clone();
        rd.write_block(1, &[9u8; 128]).unwrap();
        let mut buf = [0u8; 128];
        other.read_block(1, &mut buf).unwrap();
        assert_eq!(buf, [9u8; 128]);
    }
}
