//! Little-endian field codecs shared by every on-disk record.
//! Records never get copied in or out as raw memory; each one has an explicit
//! encode/decode pair built on these helpers.

use crate::{Error, Result};

fn ensure(buf: &[u8], offset: usize, len: usize, block: u32) -> Result<()> {
    match offset.checked_add(len) {
        Some(end) if end <= buf.len() => Ok(()),
        _ => Err(Error::Corruption {
            block,
            detail: format!("record field at {offset}+{len} exceeds {} bytes", buf.len()),
        }),
    }
}

/// Reads a u32 at `offset`; `block` is only used to label corruption.
pub fn read_u32(buf: &[u8], offset: usize, block: u32) -> Result<u32> {
    ensure(buf, offset, 4, block)?;
    Ok(u32::from_le_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ]))
}

pub fn write_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

/// Trims the zero padding of a fixed-width name buffer.
pub fn trim_zero(name: &[u8]) -> &[u8] {
    let mut end = name.len();
    while end > 0 && name[end - 1] == 0 {
        end -= 1;
    }
    &name[..end]
}
