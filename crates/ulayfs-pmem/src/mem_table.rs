//! The block registry: logical block index → typed block handle.
//!
//! This is the safe-Rust stand-in for the address-mapping table of a
//! mapped file. Blocks materialize on first touch — from the retained
//! open-time image while recovery walks the log, zeroed afterwards — and
//! keep their role for as long as the handle lives. A freshly allocated
//! index may carry a stale byte handle from a recycled data block; the tx
//! manager replaces it explicitly when extending the chain.

use crate::byte_block::ByteBlock;
use crate::tx_block::TxBlock;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use ulayfs_error::{Result, UlayfsError};
use ulayfs_types::{BLOCK_SIZE, LogicalBlockIdx};

#[derive(Debug, Clone)]
enum BlockHandle {
    Bytes(Arc<ByteBlock>),
    Tx(Arc<TxBlock>),
}

/// Registry of materialized blocks for one open file.
#[derive(Debug)]
pub struct MemTable {
    num_blocks: u32,
    blocks: RwLock<HashMap<u32, BlockHandle>>,
    /// Full file image, retained only while open-time recovery walks the
    /// log chain.
    image: Mutex<Option<Vec<u8>>>,
}

impl MemTable {
    /// Registry for a freshly created file (no image).
    #[must_use]
    pub fn new(num_blocks: u32) -> Self {
        Self {
            num_blocks,
            blocks: RwLock::new(HashMap::new()),
            image: Mutex::new(None),
        }
    }

    /// Registry over an existing file image.
    #[must_use]
    pub fn from_image(image: Vec<u8>, num_blocks: u32) -> Self {
        Self {
            num_blocks,
            blocks: RwLock::new(HashMap::new()),
            image: Mutex::new(Some(image)),
        }
    }

    #[must_use]
    pub fn num_blocks(&self) -> u32 {
        self.num_blocks
    }

    /// Whether `lbi` addresses a real, non-meta block of this file.
    #[must_use]
    pub fn in_range(&self, lbi: LogicalBlockIdx) -> bool {
        !lbi.is_null() && lbi.0 < self.num_blocks
    }

    /// The byte block at `lbi`, materializing it if needed.
    pub fn byte_block(&self, lbi: LogicalBlockIdx) -> Result<Arc<ByteBlock>> {
        self.check_range(lbi)?;
        if let Some(handle) = self.blocks.read().get(&lbi.0) {
            return match handle {
                BlockHandle::Bytes(block) => Ok(Arc::clone(block)),
                BlockHandle::Tx(_) => Err(role_mismatch(lbi, "byte")),
            };
        }

        let mut blocks = self.blocks.write();
        // Re-check under the write lock; another thread may have won.
        if let Some(handle) = blocks.get(&lbi.0) {
            return match handle {
                BlockHandle::Bytes(block) => Ok(Arc::clone(block)),
                BlockHandle::Tx(_) => Err(role_mismatch(lbi, "byte")),
            };
        }
        let block = Arc::new(self.materialize_bytes(lbi));
        blocks.insert(lbi.0, BlockHandle::Bytes(Arc::clone(&block)));
        Ok(block)
    }

    /// The tx block at `lbi`, decoding it from the open-time image if it
    /// has not been touched yet.
    pub fn tx_block(&self, lbi: LogicalBlockIdx) -> Result<Arc<TxBlock>> {
        self.check_range(lbi)?;
        if let Some(handle) = self.blocks.read().get(&lbi.0) {
            return match handle {
                BlockHandle::Tx(block) => Ok(Arc::clone(block)),
                BlockHandle::Bytes(_) => Err(role_mismatch(lbi, "tx")),
            };
        }

        let mut blocks = self.blocks.write();
        if let Some(handle) = blocks.get(&lbi.0) {
            return match handle {
                BlockHandle::Tx(block) => Ok(Arc::clone(block)),
                BlockHandle::Bytes(_) => Err(role_mismatch(lbi, "tx")),
            };
        }
        let decoded = match self.image_slice(lbi) {
            Some(bytes) => TxBlock::decode(&bytes)?,
            None => {
                return Err(UlayfsError::CorruptImage {
                    detail: format!("tx block {lbi} was never published"),
                });
            }
        };
        let block = Arc::new(decoded);
        blocks.insert(lbi.0, BlockHandle::Tx(Arc::clone(&block)));
        Ok(block)
    }

    /// Register a freshly allocated tx block, replacing any stale handle a
    /// recycled data block left behind.
    pub fn install_tx_block(&self, lbi: LogicalBlockIdx, seq: u32) -> Arc<TxBlock> {
        assert!(self.in_range(lbi), "tx block index {lbi} out of range");
        let block = Arc::new(TxBlock::new(seq));
        self.blocks
            .write()
            .insert(lbi.0, BlockHandle::Tx(Arc::clone(&block)));
        block
    }

    /// Drop the handle for `lbi`. Used when an unpublished block goes back
    /// to a free list so a later allocation can give it a new role.
    pub fn forget(&self, lbi: LogicalBlockIdx) {
        self.blocks.write().remove(&lbi.0);
    }

    /// Drop the open-time image once recovery has materialized everything
    /// the log references.
    pub fn release_image(&self) {
        *self.image.lock() = None;
    }

    fn materialize_bytes(&self, lbi: LogicalBlockIdx) -> ByteBlock {
        match self.image_slice(lbi) {
            Some(bytes) => ByteBlock::from_bytes(&bytes),
            None => ByteBlock::new_zeroed(),
        }
    }

    fn image_slice(&self, lbi: LogicalBlockIdx) -> Option<Vec<u8>> {
        let guard = self.image.lock();
        let image = guard.as_ref()?;
        let start = lbi.0 as usize * BLOCK_SIZE;
        let end = start + BLOCK_SIZE;
        (end <= image.len()).then(|| image[start..end].to_vec())
    }

    fn check_range(&self, lbi: LogicalBlockIdx) -> Result<()> {
        if self.in_range(lbi) {
            Ok(())
        } else {
            Err(UlayfsError::CorruptImage {
                detail: format!(
                    "block index {lbi} out of range for {}-block file",
                    self.num_blocks
                ),
            })
        }
    }
}

fn role_mismatch(lbi: LogicalBlockIdx, wanted: &str) -> UlayfsError {
    UlayfsError::CorruptImage {
        detail: format!("block {lbi} referenced as {wanted} but has another role"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_block_materializes_once() {
        let mem = MemTable::new(8);
        let a = mem.byte_block(LogicalBlockIdx(3)).expect("block");
        a.fill_at(0, &[1, 2, 3]);
        let b = mem.byte_block(LogicalBlockIdx(3)).expect("block again");
        let mut out = [0_u8; 3];
        b.copy_to(0, &mut out);
        assert_eq!(out, [1, 2, 3]);
    }

    #[test]
    fn meta_and_out_of_range_rejected() {
        let mem = MemTable::new(8);
        assert!(mem.byte_block(LogicalBlockIdx::META).is_err());
        assert!(mem.byte_block(LogicalBlockIdx(8)).is_err());
        assert!(!mem.in_range(LogicalBlockIdx(0)));
        assert!(mem.in_range(LogicalBlockIdx(7)));
    }

    #[test]
    fn role_mismatch_is_an_error() {
        let mem = MemTable::new(8);
        mem.byte_block(LogicalBlockIdx(2)).expect("bytes");
        assert!(mem.tx_block(LogicalBlockIdx(2)).is_err());

        mem.install_tx_block(LogicalBlockIdx(3), 1);
        assert!(mem.byte_block(LogicalBlockIdx(3)).is_err());
    }

    #[test]
    fn install_tx_block_replaces_stale_bytes() {
        let mem = MemTable::new(8);
        mem.byte_block(LogicalBlockIdx(4)).expect("bytes");
        let tx = mem.install_tx_block(LogicalBlockIdx(4), 5);
        assert_eq!(tx.seq(), 5);
        let again = mem.tx_block(LogicalBlockIdx(4)).expect("tx handle");
        assert_eq!(again.seq(), 5);
    }

    #[test]
    fn image_backing_feeds_materialization() {
        let mut image = vec![0_u8; 3 * BLOCK_SIZE];
        image[2 * BLOCK_SIZE] = 0xCD;
        let mem = MemTable::from_image(image, 3);
        let block = mem.byte_block(LogicalBlockIdx(2)).expect("block");
        assert_eq!(block.read()[0], 0xCD);

        // After releasing the image, unseen blocks materialize zeroed.
        mem.release_image();
        let fresh = mem.byte_block(LogicalBlockIdx(1)).expect("fresh block");
        assert_eq!(fresh.read()[0], 0);
    }

    #[test]
    fn unpublished_tx_block_is_corrupt() {
        let mem = MemTable::new(8);
        assert!(mem.tx_block(LogicalBlockIdx(5)).is_err());
    }
}
