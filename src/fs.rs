use std::fmt::Write as _;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::bitmap::BlockBitmap;
use crate::config::*;
use crate::directory::{DirEntry, Directory};
use crate::fd_table::FdTable;
use crate::file;
use crate::inode::{Inode, InodeTable};
use crate::superblock::{SuperBlock, read_superblock, write_superblock};
use crate::{BlockDevice, Error, Result};

/// Volume usage summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsStat {
    pub block_size: usize,
    pub total_blocks: usize,
    pub free_blocks: usize,
    pub total_inodes: usize,
    pub free_inodes: usize,
    pub files: usize,
    pub open_files: usize,
}

/// A mounted volume. Owns every piece of in-memory metadata; nothing is
/// shared between volumes, and operations are expected to run one at a time.
#[derive(Debug)]
pub struct FileSystem<D: BlockDevice> {
    device: Arc<D>,
    superblock: SuperBlock,
    bitmap: BlockBitmap,
    table: InodeTable,
    dir: Directory,
    fds: FdTable,
    /// Position of `next_file_name` in the directory.
    name_cursor: usize,
}

impl<D: BlockDevice> FileSystem<D> {
    /// Lays out a fresh volume on `device`: header, inode table, bitmap and an
    /// empty directory.
    pub fn format(device: Arc<D>, config: &FsConfig) -> Result<Self> {
        config.validate()?;
        if device.block_size() != config.block_size || device.num_blocks() != config.num_blocks {
            return Err(Error::Geometry(format!(
                "device has {} blocks of {} bytes, config asks for {} of {}",
                device.num_blocks(),
                device.block_size(),
                config.num_blocks,
                config.block_size
            )));
        }

        let layout = Layout::compute(config.block_size, config.num_blocks, config.num_inodes);
        let superblock = SuperBlock::new(&layout);
        write_superblock(&*device, &superblock)?;

        let mut bitmap = BlockBitmap::new(layout);
        bitmap.persist(&*device)?;
        let mut table = InodeTable::new(layout);
        let dir = Directory::format(&*device, &mut bitmap, &mut table, superblock.root_inode)?;
        device.flush()?;

        info!(
            block_size = layout.block_size,
            num_blocks = layout.num_blocks,
            inodes = table.capacity(),
            data_start = layout.data_start(),
            "volume formatted"
        );
        Ok(Self {
            device,
            superblock,
            bitmap,
            table,
            dir,
            fds: FdTable::new(config.max_open_files),
            name_cursor: 0,
        })
    }

    /// Loads an existing volume. Only `max_open_files` is taken from `config`;
    /// the geometry comes from the volume header.
    pub fn mount(device: Arc<D>, config: &FsConfig) -> Result<Self> {
        if config.max_open_files == 0 {
            return Err(Error::Geometry("descriptor table must be non-zero".into()));
        }
        let superblock = read_superblock(&*device)?;
        let layout = superblock.layout();
        let bitmap = BlockBitmap::load(&*device, layout)?;
        let table = InodeTable::load(&*device, layout)?;

        let root = table.get(superblock.root_inode).map_err(|_| Error::Corruption {
            block: INODE_TABLE_START as u32,
            detail: "root inode is free".into(),
        })?;
        if !root.is_dir() {
            return Err(Error::Corruption {
                block: INODE_TABLE_START as u32,
                detail: format!("root inode mode {:o} is not a directory", root.mode),
            });
        }
        let dir = Directory::load(&*device, root)?;
        let entries = dir.list();
        for (i, e) in entries.iter().enumerate() {
            let detail = if !table.is_used(e.inode_id) {
                format!("entry {} refers to free inode {}", e.name(), e.inode_id)
            } else if e.inode_id == superblock.root_inode {
                format!("entry {} refers to the directory inode", e.name())
            } else if entries[..i].iter().any(|prev| prev.name == e.name) {
                format!("entry {} appears twice", e.name())
            } else {
                continue;
            };
            return Err(Error::Corruption { block: root.direct_ptrs[0], detail });
        }

        info!(
            block_size = layout.block_size,
            num_blocks = layout.num_blocks,
            files = dir.len(),
            free_blocks = bitmap.free_blocks(),
            "volume mounted"
        );
        Ok(Self {
            device,
            superblock,
            bitmap,
            table,
            dir,
            fds: FdTable::new(config.max_open_files),
            name_cursor: 0,
        })
    }

    /// Formats when `fresh`, mounts otherwise.
    pub fn mksfs(device: Arc<D>, config: &FsConfig, fresh: bool) -> Result<Self> {
        if fresh {
            Self::format(device, config)
        } else {
            Self::mount(device, config)
        }
    }

    fn root(&self) -> u32 {
        self.superblock.root_inode
    }

    /// Opens `name`, creating an empty file if it does not exist. The cursor
    /// starts at end of file.
    pub fn open(&mut self, name: &str) -> Result<usize> {
        let ino = match self.dir.lookup(name) {
            Ok(ino) => ino,
            Err(Error::FileNotFound) => {
                // A full table must not leave a new empty file behind.
                if self.fds.open_count() == self.fds.capacity() {
                    return Err(Error::NoFreeDescriptor);
                }
                self.create(name)?
            }
            Err(e) => return Err(e),
        };
        let size = self.table.get(ino)?.size as usize;
        let fd = self.fds.open(ino, size)?;
        debug!(fd, inode = ino, name, "file opened");
        Ok(fd)
    }

    fn create(&mut self, name: &str) -> Result<u32> {
        // Validate before taking an inode.
        let mut entry = DirEntry::new(0, name)?;
        let ino = self.table.find_free_slot()?;
        entry.inode_id = ino;
        self.table.save(&*self.device, ino, Inode::new(FILE_MODE))?;

        let root = self.root();
        if let Err(e) = self.dir.insert(&*self.device, &mut self.bitmap, &mut self.table, root, entry) {
            self.table.free(&*self.device, ino)?;
            return Err(e);
        }
        debug!(inode = ino, name, "file created");
        Ok(ino)
    }

    pub fn close(&mut self, fd: usize) -> Result<()> {
        let desc = self.fds.close(fd)?;
        debug!(fd, inode = desc.inode_id, "file closed");
        Ok(())
    }

    /// Reads up to `max_len` bytes at the cursor and advances it.
    pub fn read(&mut self, fd: usize, max_len: usize) -> Result<Vec<u8>> {
        let desc = *self.fds.get(fd)?;
        let inode = self.table.get(desc.inode_id)?;
        let data = file::read(&*self.device, inode, desc.cursor, max_len)?;
        self.fds.get_mut(fd)?.cursor += data.len();
        Ok(data)
    }

    /// Writes `data` at the cursor and advances it by the bytes written.
    pub fn write(&mut self, fd: usize, data: &[u8]) -> Result<usize> {
        let desc = *self.fds.get(fd)?;
        let n = file::write(
            &*self.device,
            &mut self.bitmap,
            &mut self.table,
            desc.inode_id,
            desc.cursor,
            data,
        )?;
        self.fds.get_mut(fd)?.cursor += n;
        Ok(n)
    }

    /// Moves the cursor. Positions past end of file are accepted, but a later
    /// write there fails with `Unsupported`.
    pub fn seek(&mut self, fd: usize, offset: usize) -> Result<()> {
        self.fds.get_mut(fd)?.cursor = offset;
        Ok(())
    }

    pub fn tell(&self, fd: usize) -> Result<usize> {
        Ok(self.fds.get(fd)?.cursor)
    }

    /// Deletes `name` and frees its blocks and inode. Fails with `Busy` while
    /// a descriptor refers to it.
    pub fn remove(&mut self, name: &str) -> Result<()> {
        let ino = self.dir.lookup(name)?;
        if let Some(fd) = self.fds.find(ino) {
            warn!(fd, inode = ino, name, "remove of open file rejected");
            return Err(Error::Busy);
        }
        let inode = *self.table.get(ino)?;
        let pos = self.dir.list().iter().position(|e| e.name_eq(name));
        let root = self.root();
        self.dir.remove(&*self.device, &mut self.table, root, name)?;
        file::release(&*self.device, &mut self.bitmap, &inode)?;
        self.table.free(&*self.device, ino)?;
        // Keep the enumeration on the same next entry after compaction.
        if pos.is_some_and(|p| p < self.name_cursor) {
            self.name_cursor -= 1;
        }
        debug!(inode = ino, name, "file removed");
        Ok(())
    }

    /// Next name in directory order, or `None` once every name was returned.
    /// The enumeration only restarts on a fresh mount.
    pub fn next_file_name(&mut self) -> Option<String> {
        let entry = self.dir.list().get(self.name_cursor)?;
        self.name_cursor += 1;
        Some(entry.name())
    }

    pub fn file_size(&self, name: &str) -> Result<usize> {
        let ino = self.dir.lookup(name)?;
        Ok(self.table.get(ino)?.size as usize)
    }

    pub fn inode_of(&self, name: &str) -> Result<u32> {
        self.dir.lookup(name)
    }

    pub fn inode(&self, index: u32) -> Result<Inode> {
        self.table.get(index).copied()
    }

    /// Directory entries in insertion order.
    pub fn list(&self) -> &[DirEntry] {
        self.dir.list()
    }

    /// Whether the allocator holds `block` as used.
    pub fn block_used(&self, block: u32) -> bool {
        self.bitmap.is_used(block)
    }

    pub fn stat(&self) -> FsStat {
        FsStat {
            block_size: self.device.block_size(),
            total_blocks: self.device.num_blocks(),
            free_blocks: self.bitmap.free_blocks(),
            total_inodes: self.table.capacity(),
            free_inodes: self.table.capacity() - self.table.used_count(),
            files: self.dir.len(),
            open_files: self.fds.open_count(),
        }
    }

    pub fn sync(&self) -> Result<()> {
        self.device.flush()
    }

    /// Flushes the device and drops the in-memory state. Open descriptors are
    /// discarded.
    pub fn unmount(self) -> Result<()> {
        self.sync()?;
        info!(open_files = self.fds.open_count(), "volume unmounted");
        Ok(())
    }

    pub fn superblock(&self) -> &SuperBlock {
        &self.superblock
    }

    pub fn layout(&self) -> Layout {
        self.superblock.layout()
    }

    pub fn device(&self) -> Arc<D> {
        Arc::clone(&self.device)
    }

    pub fn dump(&self) -> String {
        let layout = self.layout();
        let stat = self.stat();
        let mut out = String::new();
        let _ = writeln!(out, "magic: {:#x}", self.superblock.magic);
        let _ = writeln!(out, "blocks: {} x {} bytes", stat.total_blocks, stat.block_size);
        let _ = writeln!(
            out,
            "inode table: blocks {}..{} ({} inodes, {} free)",
            INODE_TABLE_START,
            layout.bitmap_start(),
            stat.total_inodes,
            stat.free_inodes
        );
        let _ = writeln!(
            out,
            "bitmap: blocks {}..{}, data from block {} ({} free)",
            layout.bitmap_start(),
            layout.data_start(),
            layout.data_start(),
            stat.free_blocks
        );
        let _ = writeln!(out, "files: {} ({} open)", stat.files, stat.open_files);
        for entry in self.dir.list() {
            if let Ok(inode) = self.table.get(entry.inode_id) {
                let _ = writeln!(out, "  {:>4} {:>10} {}", entry.inode_id, inode.size, entry.name());
            }
        }
        out
    }
}
