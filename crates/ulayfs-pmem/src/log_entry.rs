//! Log entry fragments.
//!
//! A log entry records the `{virtual range → logical blocks}` mapping of
//! one transaction inside a log-entry block. Entries that do not fit the
//! remainder of a block are split into chained fragments; a fragment never
//! crosses a block boundary.
//!
//! Fragment layout (all words little-endian):
//!
//! ```text
//! word0: has_next(bit 31) | is_next_same_block(bit 30) | num_blocks(29..0)
//! word1: begin virtual block index of this fragment
//! word2: continuation — byte offset in the same block, or the LBI of the
//!        next log-entry block (fragment at offset 0); zero when final
//! then ceil(num_blocks / 64) logical block indices, one per 64-block run
//! ```

use crate::byte_block::ByteBlock;
use ulayfs_error::{Result, UlayfsError};
use ulayfs_types::{
    BLOCK_SIZE, LOG_ENTRY_HEADER_SIZE, LogicalBlockIdx, VirtualBlockIdx, log_entry_lidx_count,
};

const HAS_NEXT_BIT: u32 = 1 << 31;
const SAME_BLOCK_BIT: u32 = 1 << 30;
const NUM_BLOCKS_MASK: u32 = (1 << 30) - 1;

/// One decoded fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntryFragment {
    pub has_next: bool,
    pub is_next_same_block: bool,
    pub num_blocks: u32,
    pub begin_vidx: VirtualBlockIdx,
    /// Same-block byte offset or next-block LBI, depending on
    /// `is_next_same_block`. Meaningless when `has_next` is false.
    pub next: u32,
    /// Head of each 64-block destination run.
    pub lidxs: Vec<LogicalBlockIdx>,
}

impl LogEntryFragment {
    /// Bytes this fragment occupies in its block.
    #[must_use]
    pub fn byte_len(&self) -> usize {
        LOG_ENTRY_HEADER_SIZE + self.lidxs.len() * 4
    }

    /// The destination run covering fragment-relative block `i`:
    /// `(run head, offset within run)`.
    #[must_use]
    pub fn run_for(&self, i: u32) -> (LogicalBlockIdx, u32) {
        debug_assert!(i < self.num_blocks);
        let run = (i / 64) as usize;
        (self.lidxs[run], i % 64)
    }
}

/// Write a fragment into `block` at `offset`. The reservation pass already
/// guaranteed the fragment fits.
pub fn write_fragment(block: &ByteBlock, offset: usize, fragment: &LogEntryFragment) {
    debug_assert_eq!(
        fragment.lidxs.len(),
        log_entry_lidx_count(fragment.num_blocks) as usize
    );
    debug_assert!(offset + fragment.byte_len() <= BLOCK_SIZE);

    let mut word0 = fragment.num_blocks & NUM_BLOCKS_MASK;
    if fragment.has_next {
        word0 |= HAS_NEXT_BIT;
    }
    if fragment.is_next_same_block {
        word0 |= SAME_BLOCK_BIT;
    }

    let mut bytes = Vec::with_capacity(fragment.byte_len());
    bytes.extend_from_slice(&word0.to_le_bytes());
    bytes.extend_from_slice(&fragment.begin_vidx.0.to_le_bytes());
    bytes.extend_from_slice(&fragment.next.to_le_bytes());
    for lidx in &fragment.lidxs {
        bytes.extend_from_slice(&lidx.0.to_le_bytes());
    }
    block.fill_at(offset, &bytes);
}

/// Read the fragment at `offset` of `block`.
pub fn read_fragment(block: &ByteBlock, offset: usize) -> Result<LogEntryFragment> {
    if offset % 4 != 0 || offset + LOG_ENTRY_HEADER_SIZE > BLOCK_SIZE {
        return Err(UlayfsError::CorruptImage {
            detail: format!("log entry offset {offset} out of range"),
        });
    }
    let guard = block.read();
    let word0 = read_word(&guard[..], offset);
    let begin_vidx = VirtualBlockIdx(read_word(&guard[..], offset + 4));
    let next = read_word(&guard[..], offset + 8);

    let num_blocks = word0 & NUM_BLOCKS_MASK;
    if num_blocks == 0 {
        return Err(UlayfsError::CorruptImage {
            detail: format!("log entry at offset {offset} covers zero blocks"),
        });
    }
    let lidx_count = log_entry_lidx_count(num_blocks) as usize;
    let array_end = offset + LOG_ENTRY_HEADER_SIZE + lidx_count * 4;
    if array_end > BLOCK_SIZE {
        return Err(UlayfsError::CorruptImage {
            detail: format!("log entry at offset {offset} overruns its block"),
        });
    }

    let lidxs = (0..lidx_count)
        .map(|i| {
            LogicalBlockIdx(read_word(
                &guard[..],
                offset + LOG_ENTRY_HEADER_SIZE + i * 4,
            ))
        })
        .collect();

    Ok(LogEntryFragment {
        has_next: word0 & HAS_NEXT_BIT != 0,
        is_next_same_block: word0 & SAME_BLOCK_BIT != 0,
        num_blocks,
        begin_vidx,
        next,
        lidxs,
    })
}

fn read_word(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}
