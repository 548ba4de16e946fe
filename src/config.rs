use serde::{Deserialize, Serialize};

use crate::{Error, Result};

pub const MAGIC: u32 = 0xACBD_0005;

pub const DEFAULT_BLOCK_SIZE: usize = 1024;
pub const DEFAULT_NUM_BLOCKS: usize = 1024;
pub const DEFAULT_NUM_INODES: usize = 128;
pub const DEFAULT_MAX_OPEN_FILES: usize = 64;
pub const MIN_BLOCK_SIZE: usize = 128;

pub const SUPERBLOCK_ID: usize = 0; // Block ID for the volume header
pub const INODE_TABLE_START: usize = 1; // Inode table begins right after the header
pub const ROOT_INODE_ID: u32 = 0; // Inode index of the flat root directory

/// Sentinel for "no block" in pointer fields.
pub const NULL_PTR: u32 = u32::MAX;

pub const NUM_DIRECT_PTRS: usize = 12; // Number of direct pointers in an inode
pub const INODE_RECORD_SIZE: usize = 4 * (4 + NUM_DIRECT_PTRS); // mode, size, direct_count, indirect + ptrs
pub const INODE_TABLE_HEADER_SIZE: usize = 8; // capacity + used count

pub const DIR_HEADER_SIZE: usize = 4; // entry count
pub const DIR_ENTRY_SIZE: usize = 32; // inode id + name
pub const MAX_FILE_NAME_LEN: usize = DIR_ENTRY_SIZE - 4;

// Mode bits, POSIX layout.
pub const S_IFMT: u32 = 0o170000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFREG: u32 = 0o100000;
pub const DIR_MODE: u32 = S_IFDIR | 0o777;
pub const FILE_MODE: u32 = S_IFREG | 0o666;

/// Parameters used when formatting (and, for `max_open_files`, mounting) a volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FsConfig {
    pub block_size: usize,
    pub num_blocks: usize,
    /// Requested inode capacity. The real capacity is whatever fits into the
    /// block span needed for this many records.
    pub num_inodes: usize,
    pub max_open_files: usize,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            num_blocks: DEFAULT_NUM_BLOCKS,
            num_inodes: DEFAULT_NUM_INODES,
            max_open_files: DEFAULT_MAX_OPEN_FILES,
        }
    }
}

impl FsConfig {
    pub fn validate(&self) -> Result<()> {
        if self.block_size < MIN_BLOCK_SIZE || self.block_size % 4 != 0 {
            return Err(Error::Geometry(format!(
                "block size {} must be a multiple of 4 and at least {MIN_BLOCK_SIZE}",
                self.block_size
            )));
        }
        if self.num_inodes == 0 {
            return Err(Error::Geometry("inode capacity must be non-zero".into()));
        }
        if self.max_open_files == 0 {
            return Err(Error::Geometry("descriptor table must be non-zero".into()));
        }
        let table_bytes = self
            .num_inodes
            .checked_mul(1 + INODE_RECORD_SIZE)
            .and_then(|n| n.checked_add(INODE_TABLE_HEADER_SIZE));
        let volume_bytes = self.block_size.checked_mul(self.num_blocks);
        match (table_bytes, volume_bytes) {
            (Some(table), Some(volume)) if table <= volume && self.num_blocks <= u32::MAX as usize => {}
            _ => {
                return Err(Error::Geometry(format!(
                    "{} inodes do not fit {} blocks of {} bytes",
                    self.num_inodes, self.num_blocks, self.block_size
                )));
            }
        }

        let layout = Layout::compute(self.block_size, self.num_blocks, self.num_inodes);
        // Header, table, bitmap and at least the root directory block.
        if layout.data_start() + 1 > self.num_blocks {
            return Err(Error::Geometry(format!(
                "{} blocks cannot hold {} metadata blocks plus a directory",
                self.num_blocks,
                layout.data_start()
            )));
        }
        // Every inode but the root one must be nameable.
        if layout.inode_capacity() - 1 > layout.max_dir_entries() {
            return Err(Error::Geometry(format!(
                "{} inodes exceed the {} entries a directory of {NUM_DIRECT_PTRS} blocks holds",
                layout.inode_capacity(),
                layout.max_dir_entries()
            )));
        }
        Ok(())
    }
}

/// Block ranges of the metadata regions, derived from the volume geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub block_size: usize,
    pub num_blocks: usize,
    pub inode_table_blocks: usize,
}

impl Layout {
    /// Sizes the inode table region for `num_inodes` records.
    pub fn compute(block_size: usize, num_blocks: usize, num_inodes: usize) -> Self {
        let table_bytes = INODE_TABLE_HEADER_SIZE + num_inodes * (1 + INODE_RECORD_SIZE);
        Self {
            block_size,
            num_blocks,
            inode_table_blocks: table_bytes.div_ceil(block_size),
        }
    }

    /// Inode capacity that fits in the table span.
    pub fn inode_capacity(&self) -> usize {
        (self.inode_table_blocks * self.block_size - INODE_TABLE_HEADER_SIZE)
            / (1 + INODE_RECORD_SIZE)
    }

    pub fn bitmap_start(&self) -> usize {
        INODE_TABLE_START + self.inode_table_blocks
    }

    pub fn bitmap_blocks(&self) -> usize {
        self.num_blocks.div_ceil(self.block_size)
    }

    pub fn data_start(&self) -> usize {
        self.bitmap_start() + self.bitmap_blocks()
    }

    /// Pointers held by one indirection block.
    pub fn ptrs_per_block(&self) -> usize {
        (self.block_size - 4) / 4
    }

    /// Entries that fit a directory extent of `NUM_DIRECT_PTRS` blocks.
    pub fn max_dir_entries(&self) -> usize {
        (NUM_DIRECT_PTRS * self.block_size - DIR_HEADER_SIZE) / DIR_ENTRY_SIZE
    }

    /// Largest file in blocks: direct pointers plus one indirection block.
    pub fn max_file_blocks(&self) -> usize {
        NUM_DIRECT_PTRS + self.ptrs_per_block()
    }
}
