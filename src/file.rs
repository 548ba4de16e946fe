//! File extent resolution: byte offsets to physical blocks.
//!
//! Logical block `i` of a file lives in `direct_ptrs[i]` while `i < NUM_DIRECT_PTRS`,
//! and in slot `i - NUM_DIRECT_PTRS` of the file's indirection block past that.
//! Writes fill already-allocated blocks in place, then append the rest as one
//! freshly allocated contiguous extent.

use tracing::{debug, trace, warn};

use crate::bitmap::BlockBitmap;
use crate::codec::{read_u32, write_u32};
use crate::config::*;
use crate::inode::{Inode, InodeTable};
use crate::{BlockDevice, Error, Result};

/// Block of extra pointers for files past direct capacity.
/// Layout: pointer count (u32), then the pointers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndirectBlock {
    pub ptrs: Vec<u32>,
}

impl IndirectBlock {
    pub fn encode(&self, block_size: usize) -> Vec<u8> {
        let mut buf = vec![0u8; block_size];
        write_u32(&mut buf, 0, self.ptrs.len() as u32);
        for (i, &ptr) in self.ptrs.iter().enumerate() {
            write_u32(&mut buf, 4 + i * 4, ptr);
        }
        buf
    }

    pub fn decode(buf: &[u8], block: u32) -> Result<Self> {
        let count = read_u32(buf, 0, block)? as usize;
        if count > (buf.len() - 4) / 4 {
            return Err(Error::Corruption {
                block,
                detail: format!("indirection block claims {count} pointers"),
            });
        }
        let ptrs = (0..count)
            .map(|i| read_u32(buf, 4 + i * 4, block))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { ptrs })
    }

    pub fn load(device: &impl BlockDevice, block: u32) -> Result<Self> {
        let mut buf = vec![0u8; device.block_size()];
        device.read_block(block as usize, &mut buf)?;
        let indirect = Self::decode(&buf, block)?;
        let limit = device.num_blocks() as u32;
        if let Some(bad) = indirect.ptrs.iter().find(|&&p| p >= limit) {
            return Err(Error::Corruption {
                block,
                detail: format!("indirect pointer {bad} beyond the volume"),
            });
        }
        Ok(indirect)
    }

    pub fn store(&self, device: &impl BlockDevice, block: u32) -> Result<()> {
        device.write_block(block as usize, &self.encode(device.block_size()))
    }
}

/// Data blocks held by a file, given its loaded indirection block.
fn allocated_blocks(inode: &Inode, indirect: Option<&IndirectBlock>) -> usize {
    inode.direct_count as usize + indirect.map_or(0, |ind| ind.ptrs.len())
}

/// Physical block of logical block `index`.
fn resolve(inode: &Inode, indirect: Option<&IndirectBlock>, index: usize) -> Result<u32> {
    if index < NUM_DIRECT_PTRS {
        return inode.direct().get(index).copied().ok_or(Error::OutOfBounds);
    }
    indirect
        .and_then(|ind| ind.ptrs.get(index - NUM_DIRECT_PTRS))
        .copied()
        .ok_or(Error::FileTooLarge)
}

/// Reads up to `max_len` bytes starting at `offset`. Returns an empty buffer
/// at or past end of file.
pub fn read(device: &impl BlockDevice, inode: &Inode, offset: usize, max_len: usize) -> Result<Vec<u8>> {
    let block_size = device.block_size();
    let len = max_len.min((inode.size as usize).saturating_sub(offset));
    let mut out = Vec::with_capacity(len);
    let mut indirect: Option<IndirectBlock> = None;
    let mut block_buf = vec![0u8; block_size];
    let mut cursor = offset;

    while out.len() < len {
        let index = cursor / block_size;
        if index >= NUM_DIRECT_PTRS && indirect.is_none() {
            let ptr = inode.indirect_ptr.ok_or(Error::FileTooLarge)?;
            indirect = Some(IndirectBlock::load(device, ptr)?);
        }
        let block = resolve(inode, indirect.as_ref(), index)?;
        device.read_block(block as usize, &mut block_buf)?;

        let start = cursor % block_size;
        let n = (block_size - start).min(len - out.len());
        out.extend_from_slice(&block_buf[start..start + n]);
        cursor += n;
        trace!(block, index, n, "read block");
    }

    Ok(out)
}

/// Writes `data` at `offset` into the file at inode `ino`, then persists the
/// indirection block (if touched) and the inode table.
///
/// `offset` may not lie past end of file. If the appended tail cannot be
/// allocated, bytes already written in place are kept and returned as a short
/// count; with nothing written the allocation error is returned instead.
pub fn write(
    device: &impl BlockDevice,
    bitmap: &mut BlockBitmap,
    table: &mut InodeTable,
    ino: u32,
    offset: usize,
    data: &[u8],
) -> Result<usize> {
    let block_size = device.block_size();
    let mut inode = *table.get(ino)?;
    let mut size = inode.size as usize;
    if offset > size {
        return Err(Error::Unsupported("write past end of file"));
    }
    if data.is_empty() {
        return Ok(0);
    }

    let mut indirect = match inode.indirect_ptr {
        Some(ptr) => Some(IndirectBlock::load(device, ptr)?),
        None => None,
    };
    let mut indirect_dirty = false;
    let held = allocated_blocks(&inode, indirect.as_ref());

    // Overwrite blocks the file already owns.
    let mut written = 0;
    let mut cursor = offset;
    let mut block_buf = vec![0u8; block_size];
    while written < data.len() && cursor / block_size < held {
        let block = resolve(&inode, indirect.as_ref(), cursor / block_size)?;
        let start = cursor % block_size;
        let n = (block_size - start).min(data.len() - written);
        if n < block_size {
            device.read_block(block as usize, &mut block_buf)?;
        }
        block_buf[start..start + n].copy_from_slice(&data[written..written + n]);
        device.write_block(block as usize, &block_buf)?;
        written += n;
        cursor += n;
        trace!(block, start, n, "wrote in place");
    }
    size = size.max(cursor);

    // Append the rest as a new extent.
    let mut tail_err = None;
    if written < data.len() {
        let tail = &data[written..];
        match append(device, bitmap, &mut inode, &mut indirect, held, tail) {
            Ok(touched) => {
                indirect_dirty = touched;
                written += tail.len();
                cursor += tail.len();
                size = size.max(cursor);
            }
            Err(e) => tail_err = Some(e),
        }
    }

    if let (true, Some(ind), Some(ptr)) = (indirect_dirty, indirect.as_ref(), inode.indirect_ptr) {
        ind.store(device, ptr)?;
    }
    if written > 0 {
        inode.size = size as u32;
        table.save(device, ino, inode)?;
    }

    match tail_err {
        Some(e) if written == 0 => Err(e),
        Some(e) => {
            warn!(ino, written, requested = data.len(), error = %e, "short write");
            Ok(written)
        }
        None => Ok(written),
    }
}

/// Allocates one contiguous extent for `tail` and hands its blocks out to the
/// direct slots, then to the indirection block (created on first overflow).
/// On failure nothing stays allocated and the inode is unchanged.
/// Returns whether any pointer went into the indirection block.
fn append(
    device: &impl BlockDevice,
    bitmap: &mut BlockBitmap,
    inode: &mut Inode,
    indirect: &mut Option<IndirectBlock>,
    held: usize,
    tail: &[u8],
) -> Result<bool> {
    let block_size = device.block_size();
    let ptrs_per_block = (block_size - 4) / 4;
    let new_blocks = tail.len().div_ceil(block_size);
    let total = held + new_blocks;
    if total > NUM_DIRECT_PTRS + ptrs_per_block || total * block_size > u32::MAX as usize {
        return Err(Error::FileTooLarge);
    }

    let (start, count) = bitmap.find_space(tail.len())?;
    bitmap.allocate(device, start, count, tail)?;

    if total > NUM_DIRECT_PTRS && inode.indirect_ptr.is_none() {
        let created = bitmap.find_space(block_size).and_then(|(ind, _)| {
            bitmap.allocate(device, ind, 1, &IndirectBlock::default().encode(block_size))?;
            Ok(ind)
        });
        match created {
            Ok(ind) => {
                inode.indirect_ptr = Some(ind);
                *indirect = Some(IndirectBlock::default());
                debug!(block = ind, "indirection block created");
            }
            Err(e) => {
                bitmap.deallocate(device, start, count)?;
                return Err(e);
            }
        }
    }

    let mut touched = false;
    for block in start..start + count as u32 {
        if !inode.push_direct(block) {
            // The indirection block exists here: either loaded or just created.
            let ind = indirect.get_or_insert_with(IndirectBlock::default);
            ind.ptrs.push(block);
            touched = true;
        }
    }
    debug!(start, count, bytes = tail.len(), "extent appended");
    Ok(touched)
}

/// Releases every block reachable from `inode`: data blocks and the
/// indirection block itself.
pub fn release(device: &impl BlockDevice, bitmap: &mut BlockBitmap, inode: &Inode) -> Result<()> {
    let mut blocks = inode.direct().to_vec();
    if let Some(ptr) = inode.indirect_ptr {
        blocks.extend(IndirectBlock::load(device, ptr)?.ptrs);
        blocks.push(ptr);
    }
    blocks.sort_unstable();

    // Free contiguous runs together.
    let mut i = 0;
    while i < blocks.len() {
        let start = blocks[i];
        let mut count = 1;
        while i + count < blocks.len() && blocks[i + count] == start + count as u32 {
            count += 1;
        }
        bitmap.deallocate(device, start, count)?;
        i += count;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::RamDisk;

    const BS: usize = 1024;

    struct Fixture {
        rd: RamDisk,
        bitmap: BlockBitmap,
        table: InodeTable,
    }

    fn setup(num_blocks: usize) -> Fixture {
        let layout = Layout::compute(BS, num_blocks, 16);
        let rd = RamDisk::new(BS, num_blocks);
        let bitmap = BlockBitmap::new(layout);
        let mut table = InodeTable::new(layout);
        table.save(&rd, 1, Inode::new(FILE_MODE)).unwrap();
        Fixture { rd, bitmap, table }
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn write_at(f: &mut Fixture, offset: usize, data: &[u8]) -> Result<usize> {
        write(&f.rd, &mut f.bitmap, &mut f.table, 1, offset, data)
    }

    #[test]
    fn test_indirect_codec() {
        let ind = IndirectBlock { ptrs: vec![7, 8, 9] };
        let buf = ind.encode(128);
        assert_eq!(buf.len(), 128);
        assert_eq!(IndirectBlock::decode(&buf, 0).unwrap(), ind);
        let mut bad = buf.clone();
        write_u32(&mut bad, 0, 32);
        assert!(matches!(IndirectBlock::decode(&bad, 4), Err(Error::Corruption { block: 4, .. })));
    }

    #[test]
    fn test_direct_capacity_boundary() {
        let mut f = setup(256);
        let data = pattern(NUM_DIRECT_PTRS * BS);
        assert_eq!(write_at(&mut f, 0, &data).unwrap(), data.len());
        let inode = *f.table.get(1).unwrap();
        assert_eq!(inode.direct_count as usize, NUM_DIRECT_PTRS);
        assert_eq!(inode.indirect_ptr, None);

        assert_eq!(write_at(&mut f, data.len(), b"x").unwrap(), 1);
        let inode = *f.table.get(1).unwrap();
        let ind = IndirectBlock::load(&f.rd, inode.indirect_ptr.unwrap()).unwrap();
        assert_eq!(ind.ptrs.len(), 1);
        assert_eq!(inode.size as usize, NUM_DIRECT_PTRS * BS + 1);
    }

    #[test]
    fn test_partial_fill_then_append() {
        let mut f = setup(256);
        write_at(&mut f, 0, &pattern(100)).unwrap();
        let used = f.bitmap.used_blocks();
        // Fills the rest of block 0 in place, then one new block.
        write_at(&mut f, 100, &pattern(BS)).unwrap();
        assert_eq!(f.bitmap.used_blocks(), used + 1);

        let inode = *f.table.get(1).unwrap();
        assert_eq!(inode.size as usize, BS + 100);
        let back = read(&f.rd, &inode, 0, usize::MAX).unwrap();
        let mut expected = pattern(100);
        expected.extend(pattern(BS));
        assert_eq!(back, expected);
    }

    #[test]
    fn test_overwrite_in_place() {
        let mut f = setup(256);
        write_at(&mut f, 0, &pattern(3 * BS)).unwrap();
        let used = f.bitmap.used_blocks();
        write_at(&mut f, BS - 2, b"abcd").unwrap();
        assert_eq!(f.bitmap.used_blocks(), used);
        let inode = *f.table.get(1).unwrap();
        assert_eq!(inode.size as usize, 3 * BS);
        assert_eq!(read(&f.rd, &inode, BS - 2, 4).unwrap(), b"abcd");
    }

    #[test]
    fn test_write_past_eof_unsupported() {
        let mut f = setup(256);
        write_at(&mut f, 0, b"abc").unwrap();
        assert!(matches!(write_at(&mut f, 10, b"d"), Err(Error::Unsupported(_))));
        assert_eq!(f.table.get(1).unwrap().size, 3);
    }

    #[test]
    fn test_read_bounds() {
        let mut f = setup(256);
        write_at(&mut f, 0, b"hello world").unwrap();
        let inode = *f.table.get(1).unwrap();
        assert_eq!(read(&f.rd, &inode, 6, 100).unwrap(), b"world");
        assert!(read(&f.rd, &inode, 11, 10).unwrap().is_empty());
        assert!(read(&f.rd, &inode, 50, 10).unwrap().is_empty());
    }

    #[test]
    fn test_no_space_leaves_nothing_allocated() {
        let mut f = setup(64);
        let used = f.bitmap.used_blocks();
        let free = f.bitmap.free_blocks();
        let data = pattern((free + 1) * BS);
        assert!(matches!(write_at(&mut f, 0, &data), Err(Error::NoFreeSpace)));
        assert_eq!(f.bitmap.used_blocks(), used);
        let inode = *f.table.get(1).unwrap();
        assert_eq!(inode.size, 0);
        assert_eq!(inode.direct_count, 0);
    }

    #[test]
    fn test_short_write_keeps_in_place_bytes() {
        let mut f = setup(64);
        write_at(&mut f, 0, b"abc").unwrap();
        let free = f.bitmap.free_blocks();
        let data = pattern(BS - 3 + (free + 1) * BS);
        assert_eq!(write_at(&mut f, 3, &data).unwrap(), BS - 3);
        assert_eq!(f.table.get(1).unwrap().size as usize, BS);
        assert_eq!(f.bitmap.free_blocks(), free);
    }

    #[test]
    fn test_file_too_large() {
        let mut f = setup(512);
        let max = (NUM_DIRECT_PTRS + (BS - 4) / 4) * BS;
        assert!(matches!(write_at(&mut f, 0, &pattern(max + 1)), Err(Error::FileTooLarge)));
        assert_eq!(write_at(&mut f, 0, &pattern(max)).unwrap(), max);
        assert!(matches!(write_at(&mut f, max, b"x"), Err(Error::FileTooLarge)));
    }

    #[test]
    fn test_release() {
        let mut f = setup(256);
        let used = f.bitmap.used_blocks();
        write_at(&mut f, 0, &pattern(13000)).unwrap();
        write_at(&mut f, 13000, &pattern(5000)).unwrap();
        let inode = *f.table.get(1).unwrap();
        // 18 data blocks plus the indirection block.
        assert_eq!(f.bitmap.used_blocks(), used + 19);
        release(&f.rd, &mut f.bitmap, &inode).unwrap();
        assert_eq!(f.bitmap.used_blocks(), used);
    }
}
