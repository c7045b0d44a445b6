//! Plain 4 KiB byte blocks: data blocks and log-entry blocks.
//!
//! Contents are only shared after a commit entry publishes them, and
//! log-entry blocks are appended by their owning thread alone, so the
//! read-write lock here is uncontended by invariant; it exists to keep the
//! crate free of unsafe aliasing.

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use ulayfs_types::BLOCK_SIZE;

/// A data or log-entry block.
#[derive(Debug)]
pub struct ByteBlock {
    bytes: RwLock<Box<[u8; BLOCK_SIZE]>>,
}

impl Default for ByteBlock {
    fn default() -> Self {
        Self::new_zeroed()
    }
}

impl ByteBlock {
    #[must_use]
    pub fn new_zeroed() -> Self {
        Self {
            bytes: RwLock::new(Box::new([0; BLOCK_SIZE])),
        }
    }

    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Self {
        debug_assert_eq!(bytes.len(), BLOCK_SIZE);
        let mut boxed = Box::new([0; BLOCK_SIZE]);
        boxed.copy_from_slice(bytes);
        Self {
            bytes: RwLock::new(boxed),
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Box<[u8; BLOCK_SIZE]>> {
        self.bytes.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Box<[u8; BLOCK_SIZE]>> {
        self.bytes.write()
    }

    /// Copy `src` into the block at `offset`.
    pub fn fill_at(&self, offset: usize, src: &[u8]) {
        debug_assert!(offset + src.len() <= BLOCK_SIZE);
        self.bytes.write()[offset..offset + src.len()].copy_from_slice(src);
    }

    /// Copy `len` bytes at `offset` into `dst`.
    pub fn copy_to(&self, offset: usize, dst: &mut [u8]) {
        debug_assert!(offset + dst.len() <= BLOCK_SIZE);
        dst.copy_from_slice(&self.bytes.read()[offset..offset + dst.len()]);
    }
}
