//! Tx log blocks: fixed arrays of atomic tx entry slots chained into a
//! persistent singly-linked list.
//!
//! A slot is zero until one CAS installs a non-zero entry; installed
//! entries are immutable. The `next` pointer is CAS-published exactly once
//! after the new block's contents (including its sequence number) are
//! flushed, and flushed itself before any entry lands in the new block.

use crate::entry::TxEntry;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use ulayfs_error::{Result, UlayfsError};
use ulayfs_types::{
    BLOCK_SIZE, LogicalBlockIdx, NUM_TX_ENTRY_PER_BLOCK, TX_BLOCK_NEXT_OFFSET, TX_BLOCK_SEQ_OFFSET,
    read_le_u32, read_le_u64,
};

/// Load the entry at `idx` with acquire ordering, pairing with the
/// installer's release CAS.
pub(crate) fn load_entry(slots: &[AtomicU64], idx: u16) -> TxEntry {
    TxEntry::from_raw(slots[usize::from(idx)].load(Ordering::Acquire))
}

/// Install `entry` at `idx` if the slot is still empty. Returns the
/// winning entry on failure.
pub(crate) fn cas_entry(
    slots: &[AtomicU64],
    idx: u16,
    entry: TxEntry,
) -> std::result::Result<(), TxEntry> {
    debug_assert!(!entry.is_empty());
    slots[usize::from(idx)]
        .compare_exchange(0, entry.raw(), Ordering::Release, Ordering::Acquire)
        .map(|_| ())
        .map_err(|winner| TxEntry::from_raw(winner))
}

/// First empty slot at or after `hint`, or `None` when the array is full.
pub(crate) fn scan_tail(slots: &[AtomicU64], hint: u16) -> Option<u16> {
    (usize::from(hint)..slots.len())
        .find(|&idx| slots[idx].load(Ordering::Acquire) == 0)
        .map(|idx| idx as u16)
}

/// A 4 KiB tx log block.
#[derive(Debug)]
pub struct TxBlock {
    entries: Box<[AtomicU64]>,
    next: AtomicU32,
    seq: u32,
}

impl TxBlock {
    /// A fresh, unpublished block with the given sequence number.
    #[must_use]
    pub fn new(seq: u32) -> Self {
        Self {
            entries: (0..usize::from(NUM_TX_ENTRY_PER_BLOCK))
                .map(|_| AtomicU64::new(0))
                .collect(),
            next: AtomicU32::new(0),
            seq,
        }
    }

    /// Rebuild from a file image block.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != BLOCK_SIZE {
            return Err(UlayfsError::CorruptImage {
                detail: format!("tx block image has {} bytes", bytes.len()),
            });
        }
        let seq = read_le_u32(bytes, TX_BLOCK_SEQ_OFFSET).map_err(corrupt)?;
        let block = Self::new(seq);
        for idx in 0..usize::from(NUM_TX_ENTRY_PER_BLOCK) {
            let raw = read_le_u64(bytes, idx * 8).map_err(corrupt)?;
            block.entries[idx].store(raw, Ordering::Relaxed);
        }
        let next = read_le_u32(bytes, TX_BLOCK_NEXT_OFFSET).map_err(corrupt)?;
        block.next.store(next, Ordering::Relaxed);
        Ok(block)
    }

    /// Serialize the current contents. Used to flush a fresh block before
    /// its predecessor publishes it.
    #[must_use]
    pub fn image(&self) -> Vec<u8> {
        let mut bytes = vec![0_u8; BLOCK_SIZE];
        for (idx, slot) in self.entries.iter().enumerate() {
            bytes[idx * 8..idx * 8 + 8]
                .copy_from_slice(&slot.load(Ordering::Relaxed).to_le_bytes());
        }
        bytes[TX_BLOCK_NEXT_OFFSET..TX_BLOCK_NEXT_OFFSET + 4]
            .copy_from_slice(&self.next.load(Ordering::Relaxed).to_le_bytes());
        bytes[TX_BLOCK_SEQ_OFFSET..TX_BLOCK_SEQ_OFFSET + 4]
            .copy_from_slice(&self.seq.to_le_bytes());
        bytes
    }

    #[must_use]
    pub fn get(&self, idx: u16) -> TxEntry {
        assert!(idx < NUM_TX_ENTRY_PER_BLOCK, "tx slot {idx} out of range");
        load_entry(&self.entries, idx)
    }

    pub fn try_install(&self, idx: u16, entry: TxEntry) -> std::result::Result<(), TxEntry> {
        assert!(idx < NUM_TX_ENTRY_PER_BLOCK, "tx slot {idx} out of range");
        cas_entry(&self.entries, idx, entry)
    }

    /// First empty slot at or after `hint`, or `None` when full.
    #[must_use]
    pub fn find_tail(&self, hint: u16) -> Option<u16> {
        scan_tail(&self.entries, hint)
    }

    #[must_use]
    pub fn next_block(&self) -> LogicalBlockIdx {
        LogicalBlockIdx(self.next.load(Ordering::Acquire))
    }

    /// Publish the successor block. Only one CAS can win.
    pub fn try_set_next(&self, next: LogicalBlockIdx) -> std::result::Result<(), LogicalBlockIdx> {
        debug_assert!(!next.is_null());
        self.next
            .compare_exchange(0, next.0, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(LogicalBlockIdx)
    }

    #[must_use]
    pub fn seq(&self) -> u32 {
        self.seq
    }

    /// Byte offset of an entry slot within the block, for persistence.
    #[must_use]
    pub fn entry_offset(idx: u16) -> usize {
        usize::from(idx) * 8
    }
}

fn corrupt(err: ulayfs_types::LayoutError) -> UlayfsError {
    UlayfsError::CorruptImage {
        detail: err.to_string(),
    }
}
