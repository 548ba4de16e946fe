//! Inode records and the fixed-capacity inode table.
//!
//! Table region layout: capacity (u32), used count (u32), one used byte per
//! slot, then one `INODE_RECORD_SIZE` record per slot. Records of free slots
//! are left as they were and never decoded.

use tracing::debug;

use crate::codec::{read_u32, write_u32};
use crate::config::*;
use crate::{BlockDevice, Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Inode {
    pub mode: u32,
    /// Exact byte length; for the directory, the serialized directory length.
    pub size: u32,
    pub direct_count: u32,
    pub indirect_ptr: Option<u32>,
    pub direct_ptrs: [u32; NUM_DIRECT_PTRS],
}

impl Inode {
    pub const EMPTY: Self = Self {
        mode: 0,
        size: 0,
        direct_count: 0,
        indirect_ptr: None,
        direct_ptrs: [NULL_PTR; NUM_DIRECT_PTRS],
    };

    pub fn new(mode: u32) -> Self {
        Self { mode, ..Self::EMPTY }
    }

    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    /// Direct pointers in use.
    pub fn direct(&self) -> &[u32] {
        &self.direct_ptrs[..self.direct_count as usize]
    }

    /// Appends a direct pointer. Returns false when all direct slots are taken.
    pub fn push_direct(&mut self, block: u32) -> bool {
        let idx = self.direct_count as usize;
        if idx >= NUM_DIRECT_PTRS {
            return false;
        }
        self.direct_ptrs[idx] = block;
        self.direct_count += 1;
        true
    }

    pub fn encode(&self, buf: &mut [u8]) {
        write_u32(buf, 0, self.mode);
        write_u32(buf, 4, self.size);
        write_u32(buf, 8, self.direct_count);
        write_u32(buf, 12, self.indirect_ptr.unwrap_or(NULL_PTR));
        for (i, &ptr) in self.direct_ptrs.iter().enumerate() {
            write_u32(buf, 16 + i * 4, ptr);
        }
    }

    /// `block` labels corruption errors with the table block holding the record.
    pub fn decode(buf: &[u8], block: u32) -> Result<Self> {
        let mut inode = Self {
            mode: read_u32(buf, 0, block)?,
            size: read_u32(buf, 4, block)?,
            direct_count: read_u32(buf, 8, block)?,
            indirect_ptr: match read_u32(buf, 12, block)? {
                NULL_PTR => None,
                ptr => Some(ptr),
            },
            direct_ptrs: [NULL_PTR; NUM_DIRECT_PTRS],
        };
        if inode.direct_count as usize > NUM_DIRECT_PTRS {
            return Err(Error::Corruption {
                block,
                detail: format!("inode uses {} direct pointers", inode.direct_count),
            });
        }
        for i in 0..NUM_DIRECT_PTRS {
            inode.direct_ptrs[i] = read_u32(buf, 16 + i * 4, block)?;
        }
        Ok(inode)
    }
}

#[derive(Debug, Clone)]
pub struct InodeTable {
    layout: Layout,
    used: Vec<bool>,
    inodes: Vec<Inode>,
    used_count: usize,
    /// On-disk image of the region; free slots keep whatever bytes they had.
    region: Vec<u8>,
}

impl InodeTable {
    pub fn new(layout: Layout) -> Self {
        let capacity = layout.inode_capacity();
        Self {
            layout,
            used: vec![false; capacity],
            inodes: vec![Inode::EMPTY; capacity],
            used_count: 0,
            region: vec![0u8; layout.inode_table_blocks * layout.block_size],
        }
    }

    fn bitmap_offset() -> usize {
        INODE_TABLE_HEADER_SIZE
    }

    fn record_offset(&self, index: usize) -> usize {
        INODE_TABLE_HEADER_SIZE + self.capacity() + index * INODE_RECORD_SIZE
    }

    fn block_of(&self, offset: usize) -> u32 {
        (INODE_TABLE_START + offset / self.layout.block_size) as u32
    }

    pub fn load(device: &impl BlockDevice, layout: Layout) -> Result<Self> {
        let mut buf = vec![0u8; layout.inode_table_blocks * layout.block_size];
        device.read_blocks(INODE_TABLE_START, layout.inode_table_blocks, &mut buf)?;

        let mut table = Self::new(layout);
        let first = INODE_TABLE_START as u32;
        let capacity = read_u32(&buf, 0, first)? as usize;
        let used_count = read_u32(&buf, 4, first)? as usize;
        if capacity != table.capacity() {
            return Err(Error::Corruption {
                block: first,
                detail: format!("table capacity {capacity}, geometry allows {}", table.capacity()),
            });
        }

        let bitmap = &buf[Self::bitmap_offset()..Self::bitmap_offset() + capacity];
        for (index, &flag) in bitmap.iter().enumerate() {
            match flag {
                0 => continue,
                1 => {}
                _ => {
                    return Err(Error::Corruption {
                        block: table.block_of(Self::bitmap_offset() + index),
                        detail: format!("inode used map entry {index} holds {flag}"),
                    });
                }
            }
            let offset = table.record_offset(index);
            let block = table.block_of(offset);
            let inode = Inode::decode(&buf[offset..offset + INODE_RECORD_SIZE], block)?;
            table.check_pointers(&inode, block)?;
            table.used[index] = true;
            table.inodes[index] = inode;
        }
        table.used_count = table.used.iter().filter(|&&u| u).count();
        if table.used_count != used_count {
            return Err(Error::Corruption {
                block: first,
                detail: format!("used count {used_count}, bitmap has {}", table.used_count),
            });
        }
        table.region = buf;
        Ok(table)
    }

    fn check_pointers(&self, inode: &Inode, block: u32) -> Result<()> {
        let data = self.layout.data_start() as u32..self.layout.num_blocks as u32;
        let bad = inode.direct().iter().chain(inode.indirect_ptr.iter()).find(|&&p| !data.contains(&p));
        match bad {
            Some(ptr) => Err(Error::Corruption {
                block,
                detail: format!("inode points outside the data region: {ptr}"),
            }),
            None => Ok(()),
        }
    }

    /// Rewrites the whole table region.
    pub fn persist(&mut self, device: &impl BlockDevice) -> Result<()> {
        let capacity = self.capacity();
        write_u32(&mut self.region, 0, capacity as u32);
        write_u32(&mut self.region, 4, self.used_count as u32);
        for index in 0..capacity {
            self.region[Self::bitmap_offset() + index] = self.used[index] as u8;
            if self.used[index] {
                let offset = self.record_offset(index);
                self.inodes[index].encode(&mut self.region[offset..offset + INODE_RECORD_SIZE]);
            }
        }
        device.write_blocks(INODE_TABLE_START, self.layout.inode_table_blocks, &self.region)
    }

    /// Lowest free slot.
    pub fn find_free_slot(&self) -> Result<u32> {
        self.used
            .iter()
            .position(|&u| !u)
            .map(|i| i as u32)
            .ok_or(Error::NoFreeInode)
    }

    /// Stores `inode` at `index`, marks the slot used and persists the table.
    pub fn save(&mut self, device: &impl BlockDevice, index: u32, inode: Inode) -> Result<()> {
        let i = index as usize;
        if i >= self.capacity() {
            return Err(Error::OutOfBounds);
        }
        self.inodes[i] = inode;
        if !self.used[i] {
            self.used[i] = true;
            self.used_count += 1;
            debug!(index, "inode allocated");
        }
        self.persist(device)
    }

    /// Releases the slot. The record bytes stay behind on disk.
    pub fn free(&mut self, device: &impl BlockDevice, index: u32) -> Result<()> {
        let i = index as usize;
        if i >= self.capacity() || !self.used[i] {
            return Err(Error::FileNotFound);
        }
        self.used[i] = false;
        self.inodes[i] = Inode::EMPTY;
        self.used_count -= 1;
        debug!(index, "inode freed");
        self.persist(device)
    }

    /// Live inode at `index`.
    pub fn get(&self, index: u32) -> Result<&Inode> {
        match self.used.get(index as usize) {
            Some(true) => Ok(&self.inodes[index as usize]),
            _ => Err(Error::FileNotFound),
        }
    }

    pub fn is_used(&self, index: u32) -> bool {
        self.used.get(index as usize).copied().unwrap_or(false)
    }

    pub fn capacity(&self) -> usize {
        self.used.len()
    }

    pub fn used_count(&self) -> usize {
        self.used_count
    }

    /// (index, inode) of every used slot.
    pub fn iter_used(&self) -> impl Iterator<Item = (u32, &Inode)> {
        self.used
            .iter()
            .zip(self.inodes.iter())
            .enumerate()
            .filter(|(_, (used, _))| **used)
            .map(|(i, (_, inode))| (i as u32, inode))
    }
}
