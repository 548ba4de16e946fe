use thiserror::Error;

/// Errors returned by every file system operation.
#[derive(Debug, Error)]
pub enum FsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u32, actual: u32 },

    #[error("invalid geometry: {0}")]
    Geometry(String),

    #[error("corrupt metadata at block {block}: {detail}")]
    Corruption { block: u32, detail: String },

    #[error("block range out of bounds")]
    OutOfBounds,

    #[error("file name too long")]
    NameTooLong,

    #[error("invalid file name")]
    InvalidFileName,

    #[error("file not found")]
    FileNotFound,

    #[error("file already exists")]
    FileExists,

    #[error("file already open")]
    FileAlreadyOpen,

    #[error("file is open")]
    Busy,

    #[error("no free inode")]
    NoFreeInode,

    #[error("no free space")]
    NoFreeSpace,

    /// Indirection capacity exceeded.
    #[error("file too large")]
    FileTooLarge,

    #[error("descriptor table full")]
    NoFreeDescriptor,

    #[error("invalid file descriptor")]
    InvalidDescriptor,

    #[error("file descriptor not open")]
    DescriptorNotOpen,

    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
}

impl FsError {
    /// POSIX errno for this error.
    #[must_use]
    pub fn to_errno(&self) -> i32 {
        match self {
            Self::Io(_) | Self::Corruption { .. } | Self::OutOfBounds => 5, // EIO
            Self::InvalidMagic { .. } | Self::Geometry(_) | Self::InvalidFileName => 22, // EINVAL
            Self::NameTooLong => 36,      // ENAMETOOLONG
            Self::FileNotFound => 2,      // ENOENT
            Self::FileExists => 17,       // EEXIST
            Self::FileAlreadyOpen | Self::Busy => 16, // EBUSY
            Self::NoFreeInode | Self::NoFreeSpace => 28, // ENOSPC
            Self::FileTooLarge => 27,     // EFBIG
            Self::NoFreeDescriptor => 24, // EMFILE
            Self::InvalidDescriptor | Self::DescriptorNotOpen => 9, // EBADF
            Self::Unsupported(_) => 95,   // EOPNOTSUPP
        }
    }
}

pub type Result<T> = core::result::Result<T, FsError>;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_errno() {
        assert_eq!(FsError::FileNotFound.to_errno(), 2);
        assert_eq!(FsError::NoFreeSpace.to_errno(), 28);
        assert_eq!(FsError::DescriptorNotOpen.to_errno(), 9);
        let e = FsError::InvalidMagic { expected: 0xACBD0005, actual: 0 };
        assert_eq!(e.to_string(), "invalid magic: expected 0xacbd0005, got 0x0");
    }
}
