//! The log manager: writes and reads variable-length log entries.
//!
//! A thin adapter over the allocator's per-thread log-entry region. The
//! allocator reserves fragment slots; this module fills them in one pass
//! and flushes the written ranges without a fence — the commit entry's
//! fenced persist orders them before the transaction becomes visible.

use ulayfs_alloc::{Allocator, LogFragmentSlot};
use ulayfs_error::{Result, UlayfsError};
use ulayfs_pmem::{FsContext, LogEntryFragment, read_fragment, write_fragment};
use ulayfs_types::{BITMAP_WORD_CAPACITY, LogEntryIdx, LogicalBlockIdx, VirtualBlockIdx};

/// Upper bound on fragments walked when reading one entry, against cyclic
/// continuation pointers in a corrupt image.
const MAX_FRAGMENT_CHAIN: usize = 1024;

/// The `{virtual range → logical runs}` coverage of one log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogCoverage {
    pub begin_vidx: VirtualBlockIdx,
    pub num_blocks: u32,
    /// Head of each 64-block destination run, in virtual order.
    pub run_heads: Vec<LogicalBlockIdx>,
    /// Log-entry blocks the entry occupies (for recovery accounting).
    pub entry_blocks: Vec<LogicalBlockIdx>,
}

impl LogCoverage {
    /// The destination block for `vidx`, if this entry covers it.
    #[must_use]
    pub fn lookup(&self, vidx: VirtualBlockIdx) -> Option<LogicalBlockIdx> {
        let rel = vidx.0.checked_sub(self.begin_vidx.0)?;
        if rel >= self.num_blocks {
            return None;
        }
        let head = self.run_heads[(rel / BITMAP_WORD_CAPACITY) as usize];
        Some(LogicalBlockIdx(head.0 + rel % BITMAP_WORD_CAPACITY))
    }
}

/// Log entry writer/reader bound to one open file.
#[derive(Debug, Clone)]
pub struct LogMgr {
    ctx: FsContext,
}

impl LogMgr {
    #[must_use]
    pub fn new(ctx: FsContext) -> Self {
        Self { ctx }
    }

    /// Append one log entry mapping `[begin_vidx, begin_vidx + num_blocks)`
    /// onto `run_heads` (one head per 64-block run). Returns the locator
    /// of the first fragment.
    pub fn append(
        &self,
        allocator: &mut Allocator,
        begin_vidx: VirtualBlockIdx,
        num_blocks: u32,
        run_heads: &[LogicalBlockIdx],
    ) -> Result<LogEntryIdx> {
        debug_assert_eq!(
            run_heads.len() as u32,
            num_blocks.div_ceil(BITMAP_WORD_CAPACITY)
        );
        let slots = allocator.reserve_log_entry(&self.ctx, num_blocks)?;

        let mut consumed_blocks = 0_u32;
        let mut consumed_heads = 0_usize;
        for (pos, slot) in slots.iter().enumerate() {
            let head_count = slot.num_blocks.div_ceil(BITMAP_WORD_CAPACITY) as usize;
            let next = slots.get(pos + 1).map(|s| s.idx);
            let fragment = LogEntryFragment {
                has_next: next.is_some(),
                is_next_same_block: next
                    .is_some_and(|n| n.block_idx == slot.idx.block_idx),
                num_blocks: slot.num_blocks,
                begin_vidx: VirtualBlockIdx(begin_vidx.0 + consumed_blocks),
                next: next.map_or(0, |n| {
                    if n.block_idx == slot.idx.block_idx {
                        u32::from(n.local_offset)
                    } else {
                        n.block_idx.0
                    }
                }),
                lidxs: run_heads[consumed_heads..consumed_heads + head_count].to_vec(),
            };
            write_fragment(&slot.block, usize::from(slot.idx.local_offset), &fragment);
            self.persist_fragment(slot, &fragment);
            consumed_blocks += slot.num_blocks;
            consumed_heads += head_count;
        }

        Ok(slots[0].idx)
    }

    /// Read the full coverage of the entry at `head`, following chained
    /// fragments.
    pub fn read_coverage(&self, head: LogEntryIdx) -> Result<LogCoverage> {
        let mut coverage = LogCoverage {
            begin_vidx: VirtualBlockIdx(0),
            num_blocks: 0,
            run_heads: Vec::new(),
            entry_blocks: Vec::new(),
        };

        let mut block_idx = head.block_idx;
        let mut offset = usize::from(head.local_offset);
        for walked in 0_usize.. {
            if walked >= MAX_FRAGMENT_CHAIN {
                return Err(UlayfsError::CorruptImage {
                    detail: format!("log entry chain at {head} exceeds {MAX_FRAGMENT_CHAIN} fragments"),
                });
            }
            let block = self.ctx.mem.byte_block(block_idx)?;
            let fragment = read_fragment(&block, offset)?;
            if coverage.num_blocks == 0 {
                coverage.begin_vidx = fragment.begin_vidx;
            }
            if coverage.entry_blocks.last() != Some(&block_idx) {
                coverage.entry_blocks.push(block_idx);
            }
            coverage.num_blocks += fragment.num_blocks;
            coverage.run_heads.extend_from_slice(&fragment.lidxs);

            if !fragment.has_next {
                break;
            }
            if fragment.is_next_same_block {
                offset = fragment.next as usize;
            } else {
                block_idx = LogicalBlockIdx(fragment.next);
                offset = 0;
            }
        }
        Ok(coverage)
    }

    fn persist_fragment(&self, slot: &LogFragmentSlot, fragment: &LogEntryFragment) {
        let offset = usize::from(slot.idx.local_offset);
        let len = fragment.byte_len();
        let guard = slot.block.read();
        self.ctx
            .persist
            .persist(slot.idx.block_idx, offset, &guard[offset..offset + len]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use ulayfs_pmem::{BitmapSet, MemTable, MetaBlock, NullPersist, Persist};

    fn test_ctx(num_blocks: u32) -> FsContext {
        let persist: Arc<dyn Persist> = Arc::new(NullPersist);
        let meta = Arc::new(MetaBlock::create(num_blocks, persist.as_ref()));
        let bitmap = Arc::new(BitmapSet::new(num_blocks));
        bitmap.init_reserved(persist.as_ref());
        FsContext {
            meta,
            mem: Arc::new(MemTable::new(num_blocks)),
            bitmap,
            persist,
        }
    }

    #[test]
    fn append_and_read_small_entry() {
        let ctx = test_ctx(256);
        let log_mgr = LogMgr::new(ctx);
        let mut alloc = Allocator::new();

        let heads = vec![LogicalBlockIdx(40)];
        let idx = log_mgr
            .append(&mut alloc, VirtualBlockIdx(5), 3, &heads)
            .expect("append");
        let coverage = log_mgr.read_coverage(idx).expect("read");
        assert_eq!(coverage.begin_vidx, VirtualBlockIdx(5));
        assert_eq!(coverage.num_blocks, 3);
        assert_eq!(coverage.run_heads, heads);

        assert_eq!(coverage.lookup(VirtualBlockIdx(5)), Some(LogicalBlockIdx(40)));
        assert_eq!(coverage.lookup(VirtualBlockIdx(7)), Some(LogicalBlockIdx(42)));
        assert_eq!(coverage.lookup(VirtualBlockIdx(8)), None);
        assert_eq!(coverage.lookup(VirtualBlockIdx(4)), None);
    }

    #[test]
    fn multi_run_entry_maps_through_heads() {
        let ctx = test_ctx(256);
        let log_mgr = LogMgr::new(ctx);
        let mut alloc = Allocator::new();

        let heads = vec![LogicalBlockIdx(1000), LogicalBlockIdx(3000)];
        let idx = log_mgr
            .append(&mut alloc, VirtualBlockIdx(0), 100, &heads)
            .expect("append");
        let coverage = log_mgr.read_coverage(idx).expect("read");
        assert_eq!(
            coverage.lookup(VirtualBlockIdx(63)),
            Some(LogicalBlockIdx(1063))
        );
        assert_eq!(
            coverage.lookup(VirtualBlockIdx(64)),
            Some(LogicalBlockIdx(3000))
        );
        assert_eq!(
            coverage.lookup(VirtualBlockIdx(99)),
            Some(LogicalBlockIdx(3035))
        );
    }

    #[test]
    fn chained_entry_reassembles() {
        let ctx = test_ctx(8192);
        let log_mgr = LogMgr::new(ctx);
        let mut alloc = Allocator::new();

        // More runs than fit one log-entry block: must chain.
        let num_blocks = 1022 * 64;
        let heads: Vec<LogicalBlockIdx> =
            (0..1022).map(|i| LogicalBlockIdx(4000 + i * 64)).collect();
        let idx = log_mgr
            .append(&mut alloc, VirtualBlockIdx(9), num_blocks, &heads)
            .expect("append");

        let coverage = log_mgr.read_coverage(idx).expect("read");
        assert_eq!(coverage.begin_vidx, VirtualBlockIdx(9));
        assert_eq!(coverage.num_blocks, num_blocks);
        assert_eq!(coverage.run_heads, heads);
        assert_eq!(coverage.entry_blocks.len(), 2);
    }

    #[test]
    fn entries_pack_back_to_back() {
        let ctx = test_ctx(256);
        let log_mgr = LogMgr::new(ctx);
        let mut alloc = Allocator::new();

        let first = log_mgr
            .append(&mut alloc, VirtualBlockIdx(0), 1, &[LogicalBlockIdx(50)])
            .expect("append");
        let second = log_mgr
            .append(&mut alloc, VirtualBlockIdx(1), 1, &[LogicalBlockIdx(51)])
            .expect("append");
        assert_eq!(first.block_idx, second.block_idx);
        assert_eq!(second.local_offset, first.local_offset + 16);

        // Both entries readable after the second lands.
        assert_eq!(
            log_mgr.read_coverage(first).expect("read").run_heads,
            vec![LogicalBlockIdx(50)]
        );
    }
}
