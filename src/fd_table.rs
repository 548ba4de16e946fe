//! Open-file sessions of one mounted volume.

use crate::{Error, Result};

/// One open session: backing inode and read/write cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileDesc {
    pub inode_id: u32,
    pub cursor: usize,
}

/// Fixed-capacity descriptor table. At most one live descriptor refers to any
/// given inode.
#[derive(Debug, Clone)]
pub struct FdTable {
    slots: Vec<Option<FileDesc>>,
}

impl FdTable {
    pub fn new(capacity: usize) -> Self {
        Self { slots: vec![None; capacity] }
    }

    /// Takes the lowest free slot for `inode_id`, cursor at `cursor`.
    pub fn open(&mut self, inode_id: u32, cursor: usize) -> Result<usize> {
        if self.find(inode_id).is_some() {
            return Err(Error::FileAlreadyOpen);
        }
        let fd = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(Error::NoFreeDescriptor)?;
        self.slots[fd] = Some(FileDesc { inode_id, cursor });
        Ok(fd)
    }

    pub fn close(&mut self, fd: usize) -> Result<FileDesc> {
        self.get(fd)?;
        self.slots[fd].take().ok_or(Error::DescriptorNotOpen)
    }

    pub fn get(&self, fd: usize) -> Result<&FileDesc> {
        self.slots
            .get(fd)
            .ok_or(Error::InvalidDescriptor)?
            .as_ref()
            .ok_or(Error::DescriptorNotOpen)
    }

    pub fn get_mut(&mut self, fd: usize) -> Result<&mut FileDesc> {
        self.slots
            .get_mut(fd)
            .ok_or(Error::InvalidDescriptor)?
            .as_mut()
            .ok_or(Error::DescriptorNotOpen)
    }

    /// Descriptor currently referring to `inode_id`, if any.
    pub fn find(&self, inode_id: u32) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| slot.is_some_and(|d| d.inode_id == inode_id))
    }

    pub fn open_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}
