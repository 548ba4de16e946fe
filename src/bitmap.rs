//! Free-space allocator.
//! One byte per block across the whole volume (0 = free, 1 = used), kept in
//! memory and rewritten in full to the bitmap region after every change.

use tracing::debug;

use crate::config::Layout;
use crate::{BlockDevice, Error, Result};

#[derive(Debug, Clone)]
pub struct BlockBitmap {
    layout: Layout,
    used: Vec<bool>,
}

impl BlockBitmap {
    /// Fresh map with the metadata blocks (header, inode table, bitmap) marked used.
    pub fn new(layout: Layout) -> Self {
        let mut used = vec![false; layout.num_blocks];
        used[..layout.data_start()].fill(true);
        Self { layout, used }
    }

    pub fn load(device: &impl BlockDevice, layout: Layout) -> Result<Self> {
        let mut buf = vec![0u8; layout.bitmap_blocks() * layout.block_size];
        device.read_blocks(layout.bitmap_start(), layout.bitmap_blocks(), &mut buf)?;
        let mut used = Vec::with_capacity(layout.num_blocks);
        for (i, &b) in buf[..layout.num_blocks].iter().enumerate() {
            match b {
                0 => used.push(false),
                1 => used.push(true),
                _ => {
                    return Err(Error::Corruption {
                        block: (layout.bitmap_start() + i / layout.block_size) as u32,
                        detail: format!("bitmap entry {i} holds {b}"),
                    });
                }
            }
        }
        if used[..layout.data_start()].iter().any(|u| !u) {
            return Err(Error::Corruption {
                block: layout.bitmap_start() as u32,
                detail: "metadata blocks marked free".into(),
            });
        }
        Ok(Self { layout, used })
    }

    /// Rewrites the whole bitmap region.
    pub fn persist(&self, device: &impl BlockDevice) -> Result<()> {
        let mut buf = vec![0u8; self.layout.bitmap_blocks() * self.layout.block_size];
        for (dst, &u) in buf.iter_mut().zip(self.used.iter()) {
            *dst = u as u8;
        }
        device.write_blocks(self.layout.bitmap_start(), self.layout.bitmap_blocks(), &buf)
    }

    /// First-fit search for a run of free blocks able to hold `byte_len` bytes.
    /// Returns (start block, block count).
    pub fn find_space(&self, byte_len: usize) -> Result<(u32, usize)> {
        let count = byte_len.div_ceil(self.layout.block_size).max(1);
        let mut run_start = 0;
        let mut run_len = 0;
        for (i, &u) in self.used.iter().enumerate() {
            if u {
                run_len = 0;
                continue;
            }
            if run_len == 0 {
                run_start = i;
            }
            run_len += 1;
            if run_len == count {
                return Ok((run_start as u32, count));
            }
        }
        Err(Error::NoFreeSpace)
    }

    /// Writes `payload` (zero padded to whole blocks) into the free run
    /// [start, start + count) and marks it used.
    pub fn allocate(
        &mut self,
        device: &impl BlockDevice,
        start: u32,
        count: usize,
        payload: &[u8],
    ) -> Result<()> {
        let range = self.range(start, count)?;
        if self.used[range.clone()].iter().any(|&u| u) {
            return Err(Error::Corruption {
                block: start,
                detail: format!("allocation of {count} blocks overlaps used blocks"),
            });
        }
        let len = count * self.layout.block_size;
        if payload.len() > len {
            return Err(Error::OutOfBounds);
        }
        let mut buf = vec![0u8; len];
        buf[..payload.len()].copy_from_slice(payload);
        device.write_blocks(start as usize, count, &buf)?;

        self.used[range].fill(true);
        self.persist(device)?;
        debug!(start, count, "blocks allocated");
        Ok(())
    }

    /// Marks [start, start + count) free.
    pub fn deallocate(&mut self, device: &impl BlockDevice, start: u32, count: usize) -> Result<()> {
        let range = self.range(start, count)?;
        if range.start < self.layout.data_start() {
            return Err(Error::OutOfBounds);
        }
        self.used[range].fill(false);
        self.persist(device)?;
        debug!(start, count, "blocks freed");
        Ok(())
    }

    fn range(&self, start: u32, count: usize) -> Result<core::ops::Range<usize>> {
        let start = start as usize;
        match start.checked_add(count) {
            Some(end) if end <= self.used.len() => Ok(start..end),
            _ => Err(Error::OutOfBounds),
        }
    }

    pub fn is_used(&self, block: u32) -> bool {
        self.used.get(block as usize).copied().unwrap_or(false)
    }

    pub fn used_blocks(&self) -> usize {
        self.used.iter().filter(|&&u| u).count()
    }

    pub fn free_blocks(&self) -> usize {
        self.used.len() - self.used_blocks()
    }
}
