//! The meta block: block 0 of the file.
//!
//! First cache line: signature, logical file size, total block count, and
//! the head/tail tx-entry locators. The second cache line is reserved for
//! the truncate advisory word. Then 32 cache lines of inline bitmap words
//! (owned by [`crate::BitmapSet`]) and 30 cache lines of inline tx
//! entries, the head segment of the tx log chain.

use crate::entry::TxEntry;
use crate::persist::Persist;
use crate::tx_block::{cas_entry, load_entry, scan_tail};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::error;
use ulayfs_error::{Result, UlayfsError};
use ulayfs_types::{
    BLOCK_SIZE, FILE_SIGNATURE, LogicalBlockIdx, META_FILE_SIZE_OFFSET, META_INLINE_TX_OFFSET,
    META_NUM_BLOCKS_OFFSET, META_SIGNATURE_OFFSET, META_TX_HEAD_OFFSET, META_TX_TAIL_OFFSET,
    NUM_INLINE_TX_ENTRY, TxEntryIdx, read_le_u32, read_le_u40, read_le_u64, to_le_u40,
};

/// The decoded meta block. Bitmap words live in `BitmapSet`.
#[derive(Debug)]
pub struct MetaBlock {
    file_size: AtomicU64,
    num_blocks: u32,
    /// Packed locator of the first tx block after the inline array; its
    /// block part is the chain's next pointer out of the meta block.
    tx_head: AtomicU64,
    /// Packed tail hint; racy stores tolerated.
    tx_tail: AtomicU64,
    inline_entries: Box<[AtomicU64]>,
}

impl MetaBlock {
    /// Initialize the meta block of a freshly created file and persist the
    /// first cache line with a fence. Everything else is zero.
    #[must_use]
    pub fn create(num_blocks: u32, persist: &dyn Persist) -> Self {
        let meta = Self {
            file_size: AtomicU64::new(0),
            num_blocks,
            tx_head: AtomicU64::new(0),
            tx_tail: AtomicU64::new(0),
            inline_entries: make_slots(),
        };
        persist.persist(LogicalBlockIdx::META, META_SIGNATURE_OFFSET, FILE_SIGNATURE);
        persist.persist(
            LogicalBlockIdx::META,
            META_FILE_SIZE_OFFSET,
            &0_u64.to_le_bytes(),
        );
        persist.persist(
            LogicalBlockIdx::META,
            META_NUM_BLOCKS_OFFSET,
            &num_blocks.to_le_bytes(),
        );
        persist.fence();
        meta
    }

    /// Rebuild from the first block of a file image.
    ///
    /// A non-empty file without the magic is not this layout; opening it
    /// is fatal, matching the other violated-invariant kinds.
    pub fn decode(image: &[u8]) -> Result<Self> {
        if image.len() < BLOCK_SIZE {
            return Err(UlayfsError::CorruptImage {
                detail: format!("image of {} bytes has no meta block", image.len()),
            });
        }
        let mut signature = [0_u8; 16];
        signature.copy_from_slice(&image[META_SIGNATURE_OFFSET..META_SIGNATURE_OFFSET + 16]);
        if &signature != FILE_SIGNATURE {
            error!(target: "ulayfs::pmem", ?signature, "meta block signature mismatch");
            panic!("meta block signature mismatch: {signature:?}");
        }

        let file_size = read_le_u64(image, META_FILE_SIZE_OFFSET).map_err(corrupt)?;
        let num_blocks = read_le_u32(image, META_NUM_BLOCKS_OFFSET).map_err(corrupt)?;
        let tx_head = read_le_u40(image, META_TX_HEAD_OFFSET).map_err(corrupt)?;
        let tx_tail = read_le_u40(image, META_TX_TAIL_OFFSET).map_err(corrupt)?;

        let meta = Self {
            file_size: AtomicU64::new(file_size),
            num_blocks,
            tx_head: AtomicU64::new(tx_head),
            tx_tail: AtomicU64::new(tx_tail),
            inline_entries: make_slots(),
        };
        for idx in 0..usize::from(NUM_INLINE_TX_ENTRY) {
            let raw = read_le_u64(image, META_INLINE_TX_OFFSET + idx * 8).map_err(corrupt)?;
            meta.inline_entries[idx].store(raw, Ordering::Relaxed);
        }
        Ok(meta)
    }

    #[must_use]
    pub fn num_blocks(&self) -> u32 {
        self.num_blocks
    }

    #[must_use]
    pub fn file_size(&self) -> u64 {
        self.file_size.load(Ordering::Acquire)
    }

    /// Raise the logical file size to at least `end`, persisting on
    /// change. Concurrent extenders race monotonically.
    pub fn grow_file_size(&self, end: u64, persist: &dyn Persist) {
        let mut current = self.file_size.load(Ordering::Acquire);
        while end > current {
            match self.file_size.compare_exchange_weak(
                current,
                end,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    persist.persist(
                        LogicalBlockIdx::META,
                        META_FILE_SIZE_OFFSET,
                        &end.to_le_bytes(),
                    );
                    persist.fence();
                    return;
                }
                Err(observed) => current = observed,
            }
        }
    }

    /// Restore a file size recomputed during recovery.
    pub fn restore_file_size(&self, size: u64, persist: &dyn Persist) {
        self.file_size.store(size, Ordering::Release);
        persist.persist(
            LogicalBlockIdx::META,
            META_FILE_SIZE_OFFSET,
            &size.to_le_bytes(),
        );
        persist.fence();
    }

    /// The first tx block after the inline array, or null if the chain has
    /// not grown past the meta block.
    #[must_use]
    pub fn next_tx_block(&self) -> LogicalBlockIdx {
        TxEntryIdx::unpack(self.tx_head.load(Ordering::Acquire)).block_idx
    }

    /// Publish the first tx block. Only one CAS can win; the new packed
    /// head is persisted by the winner.
    pub fn try_set_next_tx_block(
        &self,
        block_idx: LogicalBlockIdx,
        persist: &dyn Persist,
    ) -> std::result::Result<(), LogicalBlockIdx> {
        debug_assert!(!block_idx.is_null());
        let packed = TxEntryIdx {
            block_idx,
            local_idx: 0,
        }
        .pack()
        .expect("tx head locator must pack");
        match self
            .tx_head
            .compare_exchange(0, packed, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                persist.persist(
                    LogicalBlockIdx::META,
                    META_TX_HEAD_OFFSET,
                    &to_le_u40(packed),
                );
                persist.fence();
                Ok(())
            }
            Err(observed) => Err(TxEntryIdx::unpack(observed).block_idx),
        }
    }

    /// Best-effort tail hint.
    #[must_use]
    pub fn tx_tail_hint(&self) -> TxEntryIdx {
        TxEntryIdx::unpack(self.tx_tail.load(Ordering::Relaxed))
    }

    /// Racy hint store; the caller ensures it only advances.
    pub fn store_tx_tail_hint(&self, idx: TxEntryIdx, persist: &dyn Persist) {
        let Ok(packed) = idx.pack() else {
            return;
        };
        self.tx_tail.store(packed, Ordering::Relaxed);
        persist.persist(
            LogicalBlockIdx::META,
            META_TX_TAIL_OFFSET,
            &to_le_u40(packed),
        );
    }

    #[must_use]
    pub fn get_inline_entry(&self, idx: u16) -> TxEntry {
        assert!(idx < NUM_INLINE_TX_ENTRY, "inline tx slot {idx} out of range");
        load_entry(&self.inline_entries, idx)
    }

    pub fn try_install_inline(
        &self,
        idx: u16,
        entry: TxEntry,
    ) -> std::result::Result<(), TxEntry> {
        assert!(idx < NUM_INLINE_TX_ENTRY, "inline tx slot {idx} out of range");
        cas_entry(&self.inline_entries, idx, entry)
    }

    /// First empty inline slot at or after `hint`, or `None` when full.
    #[must_use]
    pub fn find_inline_tail(&self, hint: u16) -> Option<u16> {
        scan_tail(&self.inline_entries, hint)
    }

    /// Byte offset of an inline entry slot, for persistence.
    #[must_use]
    pub fn inline_entry_offset(idx: u16) -> usize {
        META_INLINE_TX_OFFSET + usize::from(idx) * 8
    }
}

fn make_slots() -> Box<[AtomicU64]> {
    (0..usize::from(NUM_INLINE_TX_ENTRY))
        .map(|_| AtomicU64::new(0))
        .collect()
}

fn corrupt(err: ulayfs_types::LayoutError) -> UlayfsError {
    UlayfsError::CorruptImage {
        detail: err.to_string(),
    }
}
