use crate::codec::{read_u32, write_u32};
use crate::config::*;
use crate::{BlockDevice, Error, Result};

/// Volume header, block 0. Immutable after format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuperBlock {
    pub magic: u32,              // Magic number to identify the filesystem
    pub block_size: u32,         // Bytes per block
    pub num_blocks: u32,         // Total number of blocks in the volume
    pub inode_table_blocks: u32, // Span of the inode table region
    pub root_inode: u32,         // Inode index of the directory
}

impl SuperBlock {
    pub const SIZE: usize = 20;

    pub fn new(layout: &Layout) -> Self {
        Self {
            magic: MAGIC,
            block_size: layout.block_size as u32,
            num_blocks: layout.num_blocks as u32,
            inode_table_blocks: layout.inode_table_blocks as u32,
            root_inode: ROOT_INODE_ID,
        }
    }

    pub fn layout(&self) -> Layout {
        Layout {
            block_size: self.block_size as usize,
            num_blocks: self.num_blocks as usize,
            inode_table_blocks: self.inode_table_blocks as usize,
        }
    }

    pub fn encode(&self, buf: &mut [u8]) {
        write_u32(buf, 0, self.magic);
        write_u32(buf, 4, self.block_size);
        write_u32(buf, 8, self.num_blocks);
        write_u32(buf, 12, self.inode_table_blocks);
        write_u32(buf, 16, self.root_inode);
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let block = SUPERBLOCK_ID as u32;
        Ok(Self {
            magic: read_u32(buf, 0, block)?,
            block_size: read_u32(buf, 4, block)?,
            num_blocks: read_u32(buf, 8, block)?,
            inode_table_blocks: read_u32(buf, 12, block)?,
            root_inode: read_u32(buf, 16, block)?,
        })
    }
}

pub fn read_superblock<D: BlockDevice>(device: &D) -> Result<SuperBlock> {
    let mut buf = vec![0u8; device.block_size()];
    device.read_block(SUPERBLOCK_ID, &mut buf)?;
    let superblock = SuperBlock::decode(&buf)?;

    if superblock.magic != MAGIC {
        return Err(Error::InvalidMagic { expected: MAGIC, actual: superblock.magic });
    }
    if superblock.block_size as usize != device.block_size()
        || superblock.num_blocks as usize != device.num_blocks()
    {
        return Err(Error::Geometry(format!(
            "header describes {} blocks of {} bytes, device has {} blocks of {}",
            superblock.num_blocks,
            superblock.block_size,
            device.num_blocks(),
            device.block_size()
        )));
    }
    let layout = superblock.layout();
    if superblock.inode_table_blocks == 0
        || layout.data_start() >= layout.num_blocks
        || superblock.root_inode as usize >= layout.inode_capacity()
    {
        return Err(Error::Corruption {
            block: SUPERBLOCK_ID as u32,
            detail: "header regions do not fit the volume".into(),
        });
    }

    Ok(superblock)
}

pub fn write_superblock<D: BlockDevice>(device: &D, superblock: &SuperBlock) -> Result<()> {
    let mut buf = vec![0u8; device.block_size()];
    superblock.encode(&mut buf);
    device.write_block(SUPERBLOCK_ID, &buf)?;
    device.flush()?;
    Ok(())
}
