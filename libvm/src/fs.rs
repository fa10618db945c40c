//! The file interface used by file-backed VM objects.

use crate::error::{KernelError, Result};

/// A unique identifier for an inode across the entire VFS. A tuple of
/// (filesystem_id, inode_number).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct InodeId(u64, u64);

impl InodeId {
    pub fn from_fsid_and_inodeid(fs_id: u64, inode_id: u64) -> Self {
        Self(fs_id, inode_id)
    }

    pub fn fs_id(self) -> u64 {
        self.0
    }

    pub fn inode_id(self) -> u64 {
        self.1
    }
}

/// A file whose contents can be paged into memory.
///
/// Calls are synchronous and may block the faulting thread; they are never
/// made while a VM object lock is held.
pub trait Inode: Send + Sync {
    fn id(&self) -> InodeId;

    /// Current length of the file in bytes.
    fn size(&self) -> u64;

    /// Reads data from the inode at a specific `offset`.
    /// Returns the number of bytes read, which is short at end of file.
    fn read_bytes(&self, _offset: u64, _buf: &mut [u8]) -> Result<usize> {
        Err(KernelError::NotSupported)
    }

    /// Writes data to the inode at a specific `offset`.
    /// Returns the number of bytes written.
    fn write_bytes(&self, _offset: u64, _buf: &[u8]) -> Result<usize> {
        Err(KernelError::NotSupported)
    }
}
