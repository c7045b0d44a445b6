//! The 8-byte atomic tx entry word.
//!
//! A tx entry is a tagged union packed into one `u64` so that a single
//! compare-and-swap installs it. The zero word is the empty slot; any
//! installed entry is non-zero and immutable afterwards.
//!
//! Bit layout (little-endian word):
//!
//! ```text
//! tag = bits 63..62
//!   01 inline commit:   tag(2) | num_blocks-1(6) | vidx(28) | lidx(28)
//!   10 indirect commit: tag(2) | num_blocks(22)  | log_block(30) | log_offset/4(10)
//!   11 begin (reserved)
//! ```
//!
//! Inline commits carry the full mapping in the word; they are
//! representable only while both indices fit 28 bits and the write spans
//! at most 64 blocks. Indirect commits keep the block count and the log
//! entry locator in the word; the virtual start lives in the first log
//! entry fragment, one acquire-covered load away.

use ulayfs_types::{LogEntryIdx, LogicalBlockIdx, VirtualBlockIdx};

const TAG_SHIFT: u32 = 62;
const TAG_INLINE: u64 = 0b01;
const TAG_INDIRECT: u64 = 0b10;
const TAG_BEGIN: u64 = 0b11;

const INLINE_NUM_SHIFT: u32 = 56;
const INLINE_VIDX_SHIFT: u32 = 28;
const INLINE_IDX_MASK: u64 = (1 << 28) - 1;
/// Largest index representable in an inline commit.
pub const INLINE_IDX_MAX: u32 = (1 << 28) - 1;
/// Largest block count representable in an inline commit.
pub const INLINE_NUM_MAX: u32 = 64;

const INDIRECT_NUM_SHIFT: u32 = 40;
/// Largest block count representable in an indirect commit.
pub const INDIRECT_NUM_MAX: u32 = (1 << 22) - 1;

/// Raw tx entry word. `TxEntry(0)` is the empty slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TxEntry(u64);

/// Decoded view of a tx entry word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxEntryKind {
    Empty,
    InlineCommit {
        vidx: VirtualBlockIdx,
        num_blocks: u32,
        lidx: LogicalBlockIdx,
    },
    IndirectCommit {
        num_blocks: u32,
        log_idx: LogEntryIdx,
    },
    Begin,
}

impl TxEntry {
    pub const EMPTY: Self = Self(0);

    #[must_use]
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub fn raw(self) -> u64 {
        self.0
    }

    #[must_use]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Build an inline commit if the triple is representable.
    #[must_use]
    pub fn inline_commit(
        vidx: VirtualBlockIdx,
        num_blocks: u32,
        lidx: LogicalBlockIdx,
    ) -> Option<Self> {
        if num_blocks == 0
            || num_blocks > INLINE_NUM_MAX
            || vidx.0 > INLINE_IDX_MAX
            || lidx.0 > INLINE_IDX_MAX
        {
            return None;
        }
        let word = (TAG_INLINE << TAG_SHIFT)
            | (u64::from(num_blocks - 1) << INLINE_NUM_SHIFT)
            | (u64::from(vidx.0) << INLINE_VIDX_SHIFT)
            | u64::from(lidx.0);
        Some(Self(word))
    }

    /// Build an indirect commit if the pair is representable.
    #[must_use]
    pub fn indirect_commit(num_blocks: u32, log_idx: LogEntryIdx) -> Option<Self> {
        if num_blocks == 0 || num_blocks > INDIRECT_NUM_MAX {
            return None;
        }
        let packed_locator = log_idx.pack().ok()?;
        let word = (TAG_INDIRECT << TAG_SHIFT)
            | (u64::from(num_blocks) << INDIRECT_NUM_SHIFT)
            | packed_locator;
        Some(Self(word))
    }

    /// Build a begin entry. Reserved for multi-entry transactions.
    #[must_use]
    pub fn begin() -> Self {
        Self(TAG_BEGIN << TAG_SHIFT)
    }

    /// Decode the word. A non-zero word with a zero tag decodes as `Empty`
    /// and is treated as corruption by callers that validate.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // all fields are masked below 32 bits
    pub fn kind(self) -> TxEntryKind {
        match self.0 >> TAG_SHIFT {
            TAG_INLINE => TxEntryKind::InlineCommit {
                vidx: VirtualBlockIdx(((self.0 >> INLINE_VIDX_SHIFT) & INLINE_IDX_MASK) as u32),
                num_blocks: (((self.0 >> INLINE_NUM_SHIFT) & 0x3F) + 1) as u32,
                lidx: LogicalBlockIdx((self.0 & INLINE_IDX_MASK) as u32),
            },
            TAG_INDIRECT => TxEntryKind::IndirectCommit {
                num_blocks: ((self.0 >> INDIRECT_NUM_SHIFT) & ((1 << 22) - 1)) as u32,
                log_idx: LogEntryIdx::unpack(self.0 & ((1 << 40) - 1)),
            },
            TAG_BEGIN => TxEntryKind::Begin,
            _ => TxEntryKind::Empty,
        }
    }

    /// The block count of a commit entry, `None` for empty/begin.
    #[must_use]
    pub fn num_blocks(self) -> Option<u32> {
        match self.kind() {
            TxEntryKind::InlineCommit { num_blocks, .. }
            | TxEntryKind::IndirectCommit { num_blocks, .. } => Some(num_blocks),
            TxEntryKind::Empty | TxEntryKind::Begin => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_is_zero() {
        assert!(TxEntry::EMPTY.is_empty());
        assert_eq!(TxEntry::EMPTY.kind(), TxEntryKind::Empty);
    }

    #[test]
    fn inline_round_trip() {
        let entry =
            TxEntry::inline_commit(VirtualBlockIdx(3), 2, LogicalBlockIdx(17)).expect("inline");
        assert!(!entry.is_empty());
        assert_eq!(
            entry.kind(),
            TxEntryKind::InlineCommit {
                vidx: VirtualBlockIdx(3),
                num_blocks: 2,
                lidx: LogicalBlockIdx(17),
            }
        );
    }

    #[test]
    fn inline_full_width() {
        let entry = TxEntry::inline_commit(
            VirtualBlockIdx(INLINE_IDX_MAX),
            INLINE_NUM_MAX,
            LogicalBlockIdx(INLINE_IDX_MAX),
        )
        .expect("inline at max");
        assert_eq!(
            entry.kind(),
            TxEntryKind::InlineCommit {
                vidx: VirtualBlockIdx(INLINE_IDX_MAX),
                num_blocks: INLINE_NUM_MAX,
                lidx: LogicalBlockIdx(INLINE_IDX_MAX),
            }
        );
    }

    #[test]
    fn inline_rejects_unrepresentable() {
        assert!(TxEntry::inline_commit(VirtualBlockIdx(0), 0, LogicalBlockIdx(1)).is_none());
        assert!(TxEntry::inline_commit(VirtualBlockIdx(0), 65, LogicalBlockIdx(1)).is_none());
        assert!(
            TxEntry::inline_commit(VirtualBlockIdx(INLINE_IDX_MAX + 1), 1, LogicalBlockIdx(1))
                .is_none()
        );
        assert!(
            TxEntry::inline_commit(VirtualBlockIdx(0), 1, LogicalBlockIdx(INLINE_IDX_MAX + 1))
                .is_none()
        );
    }

    #[test]
    fn indirect_round_trip() {
        let log_idx = LogEntryIdx {
            block_idx: LogicalBlockIdx(99),
            local_offset: 1024,
        };
        let entry = TxEntry::indirect_commit(1000, log_idx).expect("indirect");
        assert_eq!(
            entry.kind(),
            TxEntryKind::IndirectCommit {
                num_blocks: 1000,
                log_idx,
            }
        );
        assert_eq!(entry.num_blocks(), Some(1000));
    }

    #[test]
    fn indirect_rejects_oversized_count() {
        let log_idx = LogEntryIdx::default();
        assert!(TxEntry::indirect_commit(INDIRECT_NUM_MAX + 1, log_idx).is_none());
        assert!(TxEntry::indirect_commit(0, log_idx).is_none());
    }

    #[test]
    fn begin_is_non_empty() {
        let entry = TxEntry::begin();
        assert!(!entry.is_empty());
        assert_eq!(entry.kind(), TxEntryKind::Begin);
        assert_eq!(entry.num_blocks(), None);
    }
}
