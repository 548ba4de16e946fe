//! The single flat directory.
//!
//! Serialized as an entry count followed by fixed-size entries, stored in one
//! contiguous extent addressed by the root inode's direct pointers. When an
//! insert would overflow the extent, a larger extent is allocated, the old
//! content is migrated, and the old extent is released.

use tracing::{debug, trace};

use crate::bitmap::BlockBitmap;
use crate::codec::{read_u32, trim_zero, write_u32};
use crate::config::*;
use crate::inode::{Inode, InodeTable};
use crate::{BlockDevice, Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirEntry {
    pub inode_id: u32,
    pub name: [u8; MAX_FILE_NAME_LEN],
}

impl DirEntry {
    pub fn new(inode_id: u32, name: &str) -> Result<Self> {
        let bytes = name.as_bytes();
        if bytes.is_empty() || bytes.contains(&0) {
            return Err(Error::InvalidFileName);
        }
        if bytes.len() > MAX_FILE_NAME_LEN {
            return Err(Error::NameTooLong);
        }
        let mut buf = [0; MAX_FILE_NAME_LEN];
        buf[..bytes.len()].copy_from_slice(bytes);
        Ok(Self { inode_id, name: buf })
    }

    pub fn name_bytes(&self) -> &[u8] {
        trim_zero(&self.name)
    }

    pub fn name(&self) -> String {
        String::from_utf8_lossy(self.name_bytes()).into_owned()
    }

    pub fn name_eq(&self, name: &str) -> bool {
        self.name_bytes() == name.as_bytes()
    }

    fn encode(&self, buf: &mut [u8]) {
        write_u32(buf, 0, self.inode_id);
        buf[4..DIR_ENTRY_SIZE].copy_from_slice(&self.name);
    }

    fn decode(buf: &[u8], block: u32) -> Result<Self> {
        let inode_id = read_u32(buf, 0, block)?;
        let mut name = [0; MAX_FILE_NAME_LEN];
        name.copy_from_slice(&buf[4..DIR_ENTRY_SIZE]);
        Ok(Self { inode_id, name })
    }
}

/// Contiguous extent of the directory: (first block, block count).
fn extent(root: &Inode) -> Result<(u32, usize)> {
    let ptrs = root.direct();
    let Some(&first) = ptrs.first() else {
        return Ok((NULL_PTR, 0));
    };
    let contiguous = ptrs.iter().enumerate().all(|(i, &p)| p == first + i as u32);
    if !contiguous {
        return Err(Error::Corruption {
            block: first,
            detail: "directory extent is not contiguous".into(),
        });
    }
    Ok((first, ptrs.len()))
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Directory {
    entries: Vec<DirEntry>,
}

impl Directory {
    /// Allocates a one-block extent holding an empty directory and points
    /// the root inode at it.
    pub fn format(
        device: &impl BlockDevice,
        bitmap: &mut BlockBitmap,
        table: &mut InodeTable,
        root: u32,
    ) -> Result<Self> {
        let dir = Self::default();
        let payload = dir.encode();
        let (start, count) = bitmap.find_space(payload.len())?;
        bitmap.allocate(device, start, count, &payload)?;

        let mut root_inode = Inode::new(DIR_MODE);
        root_inode.size = payload.len() as u32;
        root_inode.push_direct(start);
        table.save(device, root, root_inode)?;
        debug!(root, start, "directory created");
        Ok(dir)
    }

    pub fn load(device: &impl BlockDevice, root: &Inode) -> Result<Self> {
        let (start, count) = extent(root)?;
        if count == 0 {
            return Err(Error::Corruption {
                block: NULL_PTR,
                detail: "directory has no extent".into(),
            });
        }
        let mut buf = vec![0u8; count * device.block_size()];
        device.read_blocks(start as usize, count, &mut buf)?;
        Self::decode(&buf, start)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; DIR_HEADER_SIZE + self.entries.len() * DIR_ENTRY_SIZE];
        write_u32(&mut buf, 0, self.entries.len() as u32);
        for (i, entry) in self.entries.iter().enumerate() {
            let offset = DIR_HEADER_SIZE + i * DIR_ENTRY_SIZE;
            entry.encode(&mut buf[offset..offset + DIR_ENTRY_SIZE]);
        }
        buf
    }

    pub fn decode(buf: &[u8], block: u32) -> Result<Self> {
        let count = read_u32(buf, 0, block)? as usize;
        let needed = count
            .checked_mul(DIR_ENTRY_SIZE)
            .and_then(|n| n.checked_add(DIR_HEADER_SIZE));
        if needed.is_none_or(|n| n > buf.len()) {
            return Err(Error::Corruption {
                block,
                detail: format!("directory claims {count} entries"),
            });
        }
        let entries = (0..count)
            .map(|i| {
                let offset = DIR_HEADER_SIZE + i * DIR_ENTRY_SIZE;
                DirEntry::decode(&buf[offset..offset + DIR_ENTRY_SIZE], block)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { entries })
    }

    /// Query inode id of a file by name.
    pub fn lookup(&self, name: &str) -> Result<u32> {
        self.entries
            .iter()
            .find(|e| e.name_eq(name))
            .map(|e| e.inode_id)
            .ok_or(Error::FileNotFound)
    }

    /// Entries in insertion order.
    pub fn list(&self) -> &[DirEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Appends `entry`, growing the extent first if it cannot hold one more record.
    /// The entry's inode must already be saved.
    pub fn insert(
        &mut self,
        device: &impl BlockDevice,
        bitmap: &mut BlockBitmap,
        table: &mut InodeTable,
        root: u32,
        entry: DirEntry,
    ) -> Result<()> {
        if self.entries.iter().any(|e| e.name == entry.name) {
            return Err(Error::FileExists);
        }

        let required = DIR_HEADER_SIZE + (self.entries.len() + 1) * DIR_ENTRY_SIZE;
        let root_inode = *table.get(root)?;
        let capacity = root_inode.direct_count as usize * device.block_size();
        if required > capacity {
            self.grow(device, bitmap, table, root, required)?;
        }

        self.entries.push(entry);
        if let Err(e) = self.persist(device, table, root) {
            self.entries.pop();
            return Err(e);
        }

        let stored = Self::load(device, table.get(root)?)?;
        if stored != *self {
            return Err(Error::Corruption {
                block: root_inode.direct_ptrs[0],
                detail: "directory read-back differs from memory".into(),
            });
        }
        trace!(name = %entry.name(), inode = entry.inode_id, "directory entry added");
        Ok(())
    }

    /// Moves the directory into a fresh extent of at least `required` bytes.
    fn grow(
        &mut self,
        device: &impl BlockDevice,
        bitmap: &mut BlockBitmap,
        table: &mut InodeTable,
        root: u32,
        required: usize,
    ) -> Result<()> {
        if required.div_ceil(device.block_size()) > NUM_DIRECT_PTRS {
            return Err(Error::FileTooLarge);
        }
        let mut root_inode = *table.get(root)?;
        let (old_start, old_count) = extent(&root_inode)?;

        let (start, count) = bitmap.find_space(required)?;
        bitmap.allocate(device, start, count, &self.encode())?;

        root_inode.direct_count = 0;
        root_inode.direct_ptrs = [NULL_PTR; NUM_DIRECT_PTRS];
        for block in start..start + count as u32 {
            root_inode.push_direct(block);
        }
        if old_count > 0 {
            bitmap.deallocate(device, old_start, old_count)?;
        }
        table.save(device, root, root_inode)?;
        debug!(old_start, old_count, start, count, "directory extent grown");
        Ok(())
    }

    /// Removes the named entry, shifting later entries left.
    /// Returns its inode id; reclaiming the inode is the caller's job.
    pub fn remove(
        &mut self,
        device: &impl BlockDevice,
        table: &mut InodeTable,
        root: u32,
        name: &str,
    ) -> Result<u32> {
        let pos = self
            .entries
            .iter()
            .position(|e| e.name_eq(name))
            .ok_or(Error::FileNotFound)?;
        let entry = self.entries.remove(pos);
        if let Err(e) = self.persist(device, table, root) {
            self.entries.insert(pos, entry);
            return Err(e);
        }
        trace!(name, inode = entry.inode_id, "directory entry removed");
        Ok(entry.inode_id)
    }

    /// Writes the serialized directory over its extent and records its length
    /// in the root inode.
    fn persist(&self, device: &impl BlockDevice, table: &mut InodeTable, root: u32) -> Result<()> {
        let mut root_inode = *table.get(root)?;
        let (start, count) = extent(&root_inode)?;
        let bytes = self.encode();
        let mut buf = vec![0u8; count * device.block_size()];
        if bytes.len() > buf.len() {
            return Err(Error::NoFreeSpace);
        }
        buf[..bytes.len()].copy_from_slice(&bytes);
        device.write_blocks(start as usize, count, &buf)?;

        root_inode.size = bytes.len() as u32;
        table.save(device, root, root_inode)
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::RamDisk;

    struct Fixture {
        rd: RamDisk,
        bitmap: BlockBitmap,
        table: InodeTable,
        dir: Directory,
    }

    fn setup(block_size: usize) -> Fixture {
        let layout = Layout::compute(block_size, 128, 64);
        let rd = RamDisk::new(block_size, 128);
        let mut bitmap = BlockBitmap::new(layout);
        let mut table = InodeTable::new(layout);
        let dir = Directory::format(&rd, &mut bitmap, &mut table, ROOT_INODE_ID).unwrap();
        Fixture { rd, bitmap, table, dir }
    }

    fn add(f: &mut Fixture, name: &str) -> u32 {
        let id = f.table.find_free_slot().unwrap();
        f.table.save(&f.rd, id, Inode::new(FILE_MODE)).unwrap();
        let entry = DirEntry::new(id, name).unwrap();
        f.dir.insert(&f.rd, &mut f.bitmap, &mut f.table, ROOT_INODE_ID, entry).unwrap();
        id
    }

    #[test]
    fn test_entry_names() {
        assert!(DirEntry::new(1, "a.txt").unwrap().name_eq("a.txt"));
        assert!(!DirEntry::new(1, "a.txt").unwrap().name_eq("a.tx"));
        assert!(matches!(DirEntry::new(1, ""), Err(Error::InvalidFileName)));
        assert!(matches!(DirEntry::new(1, "a\0b"), Err(Error::InvalidFileName)));
        let long = "x".repeat(MAX_FILE_NAME_LEN + 1);
        assert!(matches!(DirEntry::new(1, &long), Err(Error::NameTooLong)));
        let exact = "x".repeat(MAX_FILE_NAME_LEN);
        assert_eq!(DirEntry::new(1, &exact).unwrap().name(), exact);
    }

    #[test]
    fn test_insert_lookup_remove() {
        let mut f = setup(1024);
        let a = add(&mut f, "a");
        let b = add(&mut f, "b");
        let c = add(&mut f, "c");
        assert_eq!(f.dir.lookup("b").unwrap(), b);

        assert_eq!(f.dir.remove(&f.rd, &mut f.table, ROOT_INODE_ID, "b").unwrap(), b);
        let names: Vec<String> = f.dir.list().iter().map(|e| e.name()).collect();
        assert_eq!(names, vec!["a", "c"]);
        assert_eq!(f.dir.list()[1].inode_id, c);
        assert!(matches!(f.dir.lookup("b"), Err(Error::FileNotFound)));
        assert!(matches!(
            f.dir.remove(&f.rd, &mut f.table, ROOT_INODE_ID, "b"),
            Err(Error::FileNotFound)
        ));

        let root = f.table.get(ROOT_INODE_ID).unwrap();
        assert_eq!(Directory::load(&f.rd, root).unwrap(), f.dir);
        assert_eq!(root.size as usize, DIR_HEADER_SIZE + 2 * DIR_ENTRY_SIZE);
        assert_eq!(f.dir.lookup("a").unwrap(), a);
    }

    #[test]
    fn test_duplicate_name() {
        let mut f = setup(1024);
        add(&mut f, "a");
        let entry = DirEntry::new(5, "a").unwrap();
        assert!(matches!(
            f.dir.insert(&f.rd, &mut f.bitmap, &mut f.table, ROOT_INODE_ID, entry),
            Err(Error::FileExists)
        ));
    }

    /// Device whose writes fail once `broken` is set.
    struct FlakyDisk {
        inner: RamDisk,
        broken: AtomicBool,
    }

    impl BlockDevice for FlakyDisk {
        fn block_size(&self) -> usize {
            self.inner.block_size()
        }

        fn num_blocks(&self) -> usize {
            self.inner.num_blocks()
        }

        fn read_blocks(&self, start: usize, count: usize, buf: &mut [u8]) -> Result<()> {
            self.inner.read_blocks(start, count, buf)
        }

        fn write_blocks(&self, start: usize, count: usize, buf: &[u8]) -> Result<()> {
            if self.broken.load(Ordering::Relaxed) {
                return Err(Error::Io(std::io::Error::other("write refused")));
            }
            self.inner.write_blocks(start, count, buf)
        }

        fn flush(&self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_failed_remove_keeps_entry() {
        let mut f = setup(1024);
        add(&mut f, "a");
        let b = add(&mut f, "b");
        add(&mut f, "c");
        let disk = FlakyDisk { inner: f.rd.clone(), broken: AtomicBool::new(true) };

        assert!(matches!(
            f.dir.remove(&disk, &mut f.table, ROOT_INODE_ID, "b"),
            Err(Error::Io(_))
        ));
        let names: Vec<String> = f.dir.list().iter().map(|e| e.name()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(f.dir.lookup("b").unwrap(), b);
        let root = f.table.get(ROOT_INODE_ID).unwrap();
        assert_eq!(Directory::load(&f.rd, root).unwrap(), f.dir);

        disk.broken.store(false, Ordering::Relaxed);
        assert_eq!(f.dir.remove(&disk, &mut f.table, ROOT_INODE_ID, "b").unwrap(), b);
        assert_eq!(f.dir.len(), 2);
    }

    #[test]
    fn test_growth_capped_at_direct_pointers() {
        // 128-byte blocks: twelve blocks name 47 files.
        let mut f = setup(128);
        for i in 0..47 {
            add(&mut f, &format!("f{i}"));
        }
        assert_eq!(f.table.get(ROOT_INODE_ID).unwrap().direct_count as usize, NUM_DIRECT_PTRS);

        let used = f.bitmap.used_blocks();
        let id = f.table.find_free_slot().unwrap();
        let entry = DirEntry::new(id, "one_more").unwrap();
        assert!(matches!(
            f.dir.insert(&f.rd, &mut f.bitmap, &mut f.table, ROOT_INODE_ID, entry),
            Err(Error::FileTooLarge)
        ));
        assert_eq!(f.dir.len(), 47);
        assert_eq!(f.bitmap.used_blocks(), used);
    }

    #[test]
    fn test_growth_moves_extent() {
        // 128-byte blocks hold the header plus 3 entries.
        let mut f = setup(128);
        let old = f.table.get(ROOT_INODE_ID).unwrap().direct_ptrs[0];
        for name in ["a", "b", "c"] {
            add(&mut f, name);
        }
        assert_eq!(f.table.get(ROOT_INODE_ID).unwrap().direct_count, 1);
        let used_before = f.bitmap.used_blocks();

        add(&mut f, "d");
        let root = *f.table.get(ROOT_INODE_ID).unwrap();
        assert_eq!(root.direct_count, 2);
        assert_ne!(root.direct_ptrs[0], old);
        assert!(!f.bitmap.is_used(old));
        assert_eq!(f.bitmap.used_blocks(), used_before + 1);

        let names: Vec<String> = Directory::load(&f.rd, &root)
            .unwrap()
            .list()
            .iter()
            .map(|e| e.name())
            .collect();
        assert_eq!(names, vec!["a", "b", "c", "d"]);
    }
}
