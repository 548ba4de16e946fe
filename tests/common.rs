//! Common utilities for tests
#![allow(dead_code)]

use std::sync::Arc;

use sfs::{FileSystem, FsConfig, RamDisk};

pub const ORANGE: &str = "\x1b[38;5;214m";
pub const RESET: &str = "\x1b[0m";

/// Provides a macro for logging messages during tests.
/// e.g. log!("placeholder") -> println!("[test] placeholder");
#[macro_export]
macro_rules! log {
    ($msg:expr) => {
        println!("{}[test] {}{}", crate::common::ORANGE, $msg, crate::common::RESET)
    };
    ($msg:expr, $($arg:tt)*) => {
        println!("{}[test] {}{}", crate::common::ORANGE, format!($msg, $($arg)*), crate::common::RESET)
    };
}

/// 1024 blocks of 1 KiB, default inode capacity.
pub fn config() -> FsConfig {
    FsConfig::default()
}

/// Freshly formatted volume plus a handle to its storage for remounting.
pub fn fresh(config: &FsConfig) -> (RamDisk, FileSystem<RamDisk>) {
    let rd = RamDisk::new(config.block_size, config.num_blocks);
    let fs = FileSystem::format(Arc::new(rd.clone()), config).unwrap();
    (rd, fs)
}

pub fn remount(rd: &RamDisk, config: &FsConfig) -> FileSystem<RamDisk> {
    FileSystem::mount(Arc::new(rd.clone()), config).unwrap()
}

/// Deterministic byte pattern distinct per `seed`.
pub fn pattern(seed: u8, len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| ((i % 251) as u8).wrapping_add(seed.wrapping_mul(31)))
        .collect()
}

/// Reads a whole file through a fresh descriptor.
pub fn read_all(fs: &mut FileSystem<RamDisk>, name: &str) -> Vec<u8> {
    let fd = fs.open(name).unwrap();
    fs.seek(fd, 0).unwrap();
    let data = fs.read(fd, usize::MAX).unwrap();
    fs.close(fd).unwrap();
    data
}

/// Creates `name` holding `data`.
pub fn put(fs: &mut FileSystem<RamDisk>, name: &str, data: &[u8]) {
    let fd = fs.open(name).unwrap();
    assert_eq!(fs.write(fd, data).unwrap(), data.len());
    fs.close(fd).unwrap();
}
