//! A simple flat file system for fixed-size block devices.
//! One directory, no permissions enforcement, no journaling.
//!
//! On-disk linear layout:
//! - Volume header (block 0)
//! - Inode table (capacity, used count, used map, inode records)
//! - Block bitmap (one byte per block)
//! - Data blocks: directory extent, file extents, indirection blocks
//!
//! Layers (from bottom to top):
//! 1. Block Device: whole-block storage.                            | User implemented, or `RamDisk` / `FileDisk`
//! 2. Bitmap / Inode Table: allocation of blocks and inode slots.   | Rewritten in full after every change
//! 3. Directory: flat name -> inode map in one growable extent.     | Fs implemented
//! 4. File: offset to block mapping, read and write paths.          | Fs implemented
//! 5. FileSystem: mount, descriptors, the POSIX-like surface.       | Single owner per mounted volume

#![forbid(unsafe_code)]

mod bitmap;
mod block_dev;
mod codec;
mod config;
mod directory;
mod error;
mod fd_table;
mod file;
mod fs;
mod inode;
mod superblock;

pub use bitmap::BlockBitmap;
pub use block_dev::{BlockDevice, FileDisk, RamDisk};
pub use config::*;
pub use directory::{DirEntry, Directory};
pub use error::FsError as Error;
pub use error::Result;
pub use fd_table::{FdTable, FileDesc};
pub use file::IndirectBlock;
pub use fs::*;
pub use inode::{Inode, InodeTable};
pub use superblock::*;
