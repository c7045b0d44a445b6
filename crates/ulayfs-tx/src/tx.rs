//! The tx manager: traversal, commit, and extension of the persistent
//! transaction log.
//!
//! The log is a singly-linked chain of entry arrays: the meta block's
//! inline array first, then tx blocks linked by CAS-published `next`
//! pointers. `(tx_seq, local_idx)` orders entries totally across the
//! chain; the meta block has sequence 0 and every hop increments it by
//! one.
//!
//! Persistence order on the commit path: the destination data and log
//! entry bytes are already flushed unfenced when `try_commit` runs; the
//! winning CAS flushes the 8-byte entry and fences, making the
//! transaction visible exactly at that fence. Extending the chain flushes
//! the fresh block before publishing the `next` word and flushes the
//! `next` word before any entry lands in the new block.

use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{debug, trace};
use ulayfs_alloc::Allocator;
use ulayfs_error::Result;
use ulayfs_pmem::{FsContext, MetaBlock, TxBlock, TxEntry, TxEntryKind, read_fragment};
use ulayfs_types::{LogicalBlockIdx, TxEntryIdx, VirtualBlockIdx};

/// A position in the tx log chain, carrying the resolved block handle so
/// hot loops avoid registry lookups. `block` is `None` exactly on the meta
/// block. `local_idx` may sit one past the last slot when the chain has no
/// successor yet (the overflow state).
#[derive(Debug, Clone)]
pub struct TxCursor {
    pub idx: TxEntryIdx,
    block: Option<Arc<TxBlock>>,
}

impl TxCursor {
    /// The head of the chain: slot 0 of the meta block's inline array.
    #[must_use]
    pub fn start() -> Self {
        Self {
            idx: TxEntryIdx::default(),
            block: None,
        }
    }

    /// Sequence number of the block under the cursor.
    #[must_use]
    pub fn seq(&self) -> u32 {
        self.block.as_ref().map_or(0, |b| b.seq())
    }

    /// Whether the cursor sits past the last slot of a chain with no
    /// successor.
    #[must_use]
    pub fn is_overflow(&self) -> bool {
        self.idx.local_idx >= self.idx.block_capacity()
    }
}

/// Transaction log manager bound to one open file.
#[derive(Debug, Clone)]
pub struct TxMgr {
    ctx: FsContext,
}

impl TxMgr {
    #[must_use]
    pub fn new(ctx: FsContext) -> Self {
        Self { ctx }
    }

    #[must_use]
    pub fn meta(&self) -> &MetaBlock {
        &self.ctx.meta
    }

    /// Resolve a cursor for an arbitrary locator.
    pub fn cursor_at(&self, idx: TxEntryIdx) -> Result<TxCursor> {
        let block = if idx.block_idx.is_null() {
            None
        } else {
            Some(self.ctx.mem.tx_block(idx.block_idx)?)
        };
        Ok(TxCursor { idx, block })
    }

    /// Acquire-load the entry under the cursor.
    #[must_use]
    pub fn entry_at(&self, cursor: &TxCursor) -> TxEntry {
        match &cursor.block {
            None => self.ctx.meta.get_inline_entry(cursor.idx.local_idx),
            Some(block) => block.get(cursor.idx.local_idx),
        }
    }

    /// Total order between two positions: `(tx_seq, local_idx)`.
    #[must_use]
    pub fn compare(&self, a: &TxCursor, b: &TxCursor) -> Ordering {
        (a.seq(), a.idx.local_idx).cmp(&(b.seq(), b.idx.local_idx))
    }

    /// Move to the next slot. With an allocator the chain is extended on
    /// demand and the result is always `true`; without one, `false` means
    /// the cursor is parked in the overflow state at the chain's end.
    pub fn advance(
        &self,
        cursor: &mut TxCursor,
        allocator: Option<&mut Allocator>,
    ) -> Result<bool> {
        cursor.idx.local_idx += 1;
        self.handle_overflow(cursor, allocator)
    }

    /// Resolve an overflow state if possible. Follows the published
    /// `next` pointer, or allocates and publishes a fresh tx block when an
    /// allocator is supplied.
    pub fn handle_overflow(
        &self,
        cursor: &mut TxCursor,
        allocator: Option<&mut Allocator>,
    ) -> Result<bool> {
        let capacity = cursor.idx.block_capacity();
        if cursor.idx.local_idx < capacity {
            return Ok(true);
        }
        debug_assert!(
            cursor.idx.local_idx == capacity,
            "cursor advanced past the overflow slot"
        );

        let published = match &cursor.block {
            None => self.ctx.meta.next_tx_block(),
            Some(block) => block.next_block(),
        };
        let next = if published.is_null() {
            match allocator {
                None => {
                    cursor.idx.local_idx = capacity;
                    return Ok(false);
                }
                Some(allocator) => self.extend_chain(cursor, allocator)?,
            }
        } else {
            published
        };

        let block = self.ctx.mem.tx_block(next)?;
        cursor.idx = TxEntryIdx {
            block_idx: next,
            local_idx: cursor.idx.local_idx - capacity,
        };
        cursor.block = Some(block);
        Ok(true)
    }

    /// Try to install `entry` at the cursor. On success the entry is
    /// flushed with a fence and `Ok(None)` returns. On a lost race the
    /// winning entry returns, unless `cont_if_fail` keeps advancing and
    /// retrying until a CAS wins.
    pub fn try_commit(
        &self,
        entry: TxEntry,
        cursor: &mut TxCursor,
        allocator: &mut Allocator,
        cont_if_fail: bool,
    ) -> Result<Option<TxEntry>> {
        loop {
            self.handle_overflow(cursor, Some(allocator))?;
            let installed = match &cursor.block {
                None => self.ctx.meta.try_install_inline(cursor.idx.local_idx, entry),
                Some(block) => block.try_install(cursor.idx.local_idx, entry),
            };
            match installed {
                Ok(()) => {
                    self.persist_entry(cursor, entry);
                    self.refresh_tail_hint(cursor);
                    trace!(
                        target: "ulayfs::tx",
                        block = cursor.idx.block_idx.0,
                        slot = cursor.idx.local_idx,
                        "commit entry installed"
                    );
                    return Ok(None);
                }
                Err(winner) => {
                    if !cont_if_fail {
                        return Ok(Some(winner));
                    }
                    self.advance(cursor, Some(allocator))?;
                }
            }
        }
    }

    /// Hint-driven scan to the first empty slot from the cursor onward.
    /// Best-effort: the returned position may be stale by the time the
    /// caller uses it.
    pub fn find_tail(&self, cursor: &mut TxCursor) -> Result<()> {
        self.jump_to_hint(cursor)?;
        loop {
            let found = match &cursor.block {
                None => self.ctx.meta.find_inline_tail(cursor.idx.local_idx),
                Some(block) => block.find_tail(cursor.idx.local_idx),
            };
            match found {
                Some(local) => {
                    cursor.idx.local_idx = local;
                    return Ok(());
                }
                None => {
                    cursor.idx.local_idx = cursor.idx.block_capacity();
                    if !self.handle_overflow(cursor, None)? {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// The virtual range `(begin, num_blocks)` of a commit entry, reading
    /// through the log entry locator for the indirect form. `None` for
    /// begin entries.
    pub fn commit_range(&self, entry: TxEntry) -> Result<Option<(VirtualBlockIdx, u32)>> {
        match entry.kind() {
            TxEntryKind::InlineCommit {
                vidx, num_blocks, ..
            } => Ok(Some((vidx, num_blocks))),
            TxEntryKind::IndirectCommit {
                num_blocks,
                log_idx,
            } => {
                let block = self.ctx.mem.byte_block(log_idx.block_idx)?;
                let fragment = read_fragment(&block, usize::from(log_idx.local_offset))?;
                Ok(Some((fragment.begin_vidx, num_blocks)))
            }
            TxEntryKind::Empty | TxEntryKind::Begin => Ok(None),
        }
    }

    /// Allocate, initialize, and publish the successor of the block under
    /// `cursor`. Exactly one racing writer wins the publication CAS; the
    /// loser recycles its block and adopts the winner's.
    fn extend_chain(
        &self,
        cursor: &TxCursor,
        allocator: &mut Allocator,
    ) -> Result<LogicalBlockIdx> {
        let lbi = allocator.alloc(&self.ctx, 1)?;
        let seq = cursor.seq() + 1;
        let fresh = self.ctx.mem.install_tx_block(lbi, seq);

        // Contents (zeroed slots + seq) reach the image before the next
        // pointer can.
        self.ctx.persist.persist(lbi, 0, &fresh.image());
        self.ctx.persist.fence();

        let publish = match &cursor.block {
            None => self
                .ctx
                .meta
                .try_set_next_tx_block(lbi, self.ctx.persist.as_ref()),
            Some(prev) => prev.try_set_next(lbi).map(|()| {
                self.persist_next_pointer(cursor.idx.block_idx, prev);
            }),
        };

        match publish {
            Ok(()) => {
                debug!(target: "ulayfs::tx", lbi = lbi.0, seq, "tx chain extended");
                Ok(lbi)
            }
            Err(winner) => {
                self.ctx.mem.forget(lbi);
                allocator.free(lbi, 1);
                trace!(target: "ulayfs::tx", lost = lbi.0, winner = winner.0, "chain extension race lost");
                Ok(winner)
            }
        }
    }

    fn persist_next_pointer(&self, prev_idx: LogicalBlockIdx, prev: &Arc<TxBlock>) {
        let next = prev.next_block();
        self.ctx.persist.persist(
            prev_idx,
            ulayfs_types::TX_BLOCK_NEXT_OFFSET,
            &next.0.to_le_bytes(),
        );
        self.ctx.persist.fence();
    }

    fn persist_entry(&self, cursor: &TxCursor, entry: TxEntry) {
        let (block, offset) = match &cursor.block {
            None => (
                LogicalBlockIdx::META,
                MetaBlock::inline_entry_offset(cursor.idx.local_idx),
            ),
            Some(_) => (
                cursor.idx.block_idx,
                TxBlock::entry_offset(cursor.idx.local_idx),
            ),
        };
        self.ctx
            .persist
            .persist(block, offset, &entry.raw().to_le_bytes());
        self.ctx.persist.fence();
    }

    /// Racy monotonic advance of the meta tail hint; only the block part
    /// matters, so the store happens on block transitions alone.
    fn refresh_tail_hint(&self, cursor: &TxCursor) {
        let hint = self.ctx.meta.tx_tail_hint();
        if hint.block_idx == cursor.idx.block_idx {
            return;
        }
        let hint_seq = if hint.block_idx.is_null() {
            0
        } else {
            match self.ctx.mem.tx_block(hint.block_idx) {
                Ok(block) => block.seq(),
                Err(_) => return,
            }
        };
        if cursor.seq() > hint_seq {
            self.ctx
                .meta
                .store_tx_tail_hint(cursor.idx, self.ctx.persist.as_ref());
        }
    }

    /// Jump the cursor to the meta tail hint when the hint is ahead.
    fn jump_to_hint(&self, cursor: &mut TxCursor) -> Result<()> {
        let hint = self.ctx.meta.tx_tail_hint();
        if hint.block_idx == cursor.idx.block_idx {
            cursor.idx.local_idx = cursor.idx.local_idx.max(hint.local_idx);
            return Ok(());
        }
        let Ok(hinted) = self.cursor_at(hint) else {
            return Ok(());
        };
        if self.compare(&hinted, cursor) == Ordering::Greater {
            *cursor = hinted;
        }
        Ok(())
    }
}
