//! The copy-on-write write path.
//!
//! A write never touches published blocks: it allocates destination
//! blocks, composes their full contents (merging partial edges from the
//! current projection), flushes them, then races to install one commit
//! entry. Three strategies by alignment:
//!
//! - aligned: every block comes straight from the user buffer; a lost
//!   commit CAS needs no recopy, only a retry at the next slot.
//! - single-block unaligned: one destination block with prefix/suffix
//!   merged from the projected source.
//! - multi-block unaligned: partial head and tail blocks plus a fully
//!   user-supplied interior.
//!
//! On a lost CAS the conflicting entry's virtual range is checked against
//! the partial edges. An overlapping edge means the projection moved under
//! us: re-resolve the source, recopy only that edge's prefix/suffix (the
//! user bytes in between stay valid), re-flush, and retry at the next
//! slot. Disjoint entries just advance the cursor.

use crate::log::LogMgr;
use crate::tx::{TxCursor, TxMgr};
use tracing::{debug, trace};
use ulayfs_alloc::Allocator;
use ulayfs_error::{Result, UlayfsError};
use ulayfs_pmem::{FsContext, TxEntry};
use ulayfs_types::{
    BITMAP_WORD_CAPACITY, BLOCK_SIZE, LogicalBlockIdx, VirtualBlockIdx, block_local_offset,
    covering_block_range,
};

/// Read access to the committed projection. Implemented by the block
/// table; the write path sees only this surface.
pub trait BlockView: Send + Sync {
    /// Apply committed entries up to the current tail; returns a cursor
    /// at the first empty slot the projection has seen.
    fn update(&self) -> Result<TxCursor>;

    /// Projected logical block for `vidx` as of the last `update` (null
    /// for holes).
    fn get(&self, vidx: VirtualBlockIdx) -> LogicalBlockIdx;
}

/// Shared subsystems the write path borrows per call.
#[derive(Clone, Copy)]
pub struct WriteCtx<'a> {
    pub ctx: &'a FsContext,
    pub tx_mgr: &'a TxMgr,
    pub log_mgr: &'a LogMgr,
    pub view: &'a dyn BlockView,
}

/// Execute one positional write. Returns after the commit entry is
/// installed and fenced; the caller refreshes its projection and file
/// size.
pub fn do_pwrite(
    write: WriteCtx<'_>,
    allocator: &mut Allocator,
    buf: &[u8],
    offset: u64,
) -> Result<()> {
    if buf.is_empty() {
        return Ok(());
    }
    let count = buf.len() as u64;
    let (vb, ve) = covering_block_range(offset, count);
    let num_blocks = ve.0 - vb.0;

    let runs = alloc_runs(allocator, write.ctx, num_blocks)?;
    let outcome = CowTx {
        write,
        buf,
        offset,
        vb,
        ve,
        num_blocks,
        runs: &runs,
        first_local: block_local_offset(offset),
        last_end: match block_local_offset(offset + count) {
            0 => BLOCK_SIZE,
            partial => partial,
        },
    }
    .run(allocator);

    if outcome.is_err() {
        for &(head, len) in &runs {
            allocator.free(head, len);
        }
    }
    outcome
}

/// One in-flight write: borrowed subsystems plus the derived geometry.
struct CowTx<'a> {
    write: WriteCtx<'a>,
    buf: &'a [u8],
    offset: u64,
    vb: VirtualBlockIdx,
    ve: VirtualBlockIdx,
    num_blocks: u32,
    runs: &'a [(LogicalBlockIdx, u32)],
    /// Byte offset of the write within its first block.
    first_local: usize,
    /// Byte offset one past the write within its last block (`BLOCK_SIZE`
    /// when the tail is aligned).
    last_end: usize,
}

impl CowTx<'_> {
    fn run(&self, allocator: &mut Allocator) -> Result<()> {
        let aligned = self.first_local == 0 && self.last_end == BLOCK_SIZE;
        trace!(
            target: "ulayfs::cow",
            offset = self.offset,
            len = self.buf.len(),
            vb = self.vb.0,
            num = self.num_blocks,
            strategy = if aligned {
                "aligned"
            } else if self.num_blocks == 1 {
                "single"
            } else {
                "multi"
            },
            "pwrite"
        );

        let mut cursor = self.write.view.update()?;
        self.copy_blocks()?;
        let entry = self.build_entry(allocator)?;

        if aligned {
            // Fully user-supplied contents: any conflict is resolved by
            // moving to the next slot, never by recopying, so skipping
            // ahead to the tail is safe.
            self.write.tx_mgr.find_tail(&mut cursor)?;
            self.write
                .tx_mgr
                .try_commit(entry, &mut cursor, allocator, true)?;
            return Ok(());
        }
        // Partial edges were merged from the projection at `cursor`; the
        // commit must start there so every entry installed since then
        // fails the CAS and gets its range checked against the edges.
        self.commit_with_edge_checks(entry, &mut cursor, allocator)
    }

    /// Compose and flush every destination block.
    fn copy_blocks(&self) -> Result<()> {
        let count = self.buf.len() as u64;
        for i in 0..self.num_blocks {
            let dst = self.dst_lbi(i);
            let block = self.write.ctx.mem.byte_block(dst)?;

            let block_start = VirtualBlockIdx(self.vb.0 + i).byte_offset();
            let from = block_start.max(self.offset);
            let to = (block_start + BLOCK_SIZE as u64).min(self.offset + count);
            let dst_lo = (from - block_start) as usize;
            let dst_hi = (to - block_start) as usize;

            if dst_lo > 0 {
                self.copy_edge(&block, self.vb, 0, dst_lo)?;
            }
            block.fill_at(
                dst_lo,
                &self.buf[(from - self.offset) as usize..(to - self.offset) as usize],
            );
            if dst_hi < BLOCK_SIZE {
                self.copy_edge(&block, VirtualBlockIdx(self.ve.0 - 1), dst_hi, BLOCK_SIZE)?;
            }

            let guard = block.read();
            self.write.ctx.persist.persist(dst, 0, &guard[..]);
        }
        Ok(())
    }

    /// Copy `[lo, hi)` of the projected source for `vidx` into the same
    /// range of `dst`; zero-fill when the source is a hole.
    fn copy_edge(
        &self,
        dst: &ulayfs_pmem::ByteBlock,
        vidx: VirtualBlockIdx,
        lo: usize,
        hi: usize,
    ) -> Result<()> {
        debug_assert!(lo < hi && hi <= BLOCK_SIZE);
        let src = self.write.view.get(vidx);
        if src.is_null() {
            dst.fill_at(lo, &vec![0_u8; hi - lo]);
            return Ok(());
        }
        let src_block = self.write.ctx.mem.byte_block(src)?;
        let mut bytes = vec![0_u8; hi - lo];
        src_block.copy_to(lo, &mut bytes);
        dst.fill_at(lo, &bytes);
        Ok(())
    }

    /// Build the commit entry, inlining when representable and otherwise
    /// appending a log entry for the indirect form.
    fn build_entry(&self, allocator: &mut Allocator) -> Result<TxEntry> {
        if self.runs.len() == 1 {
            if let Some(entry) =
                TxEntry::inline_commit(self.vb, self.num_blocks, self.runs[0].0)
            {
                return Ok(entry);
            }
        }
        let heads: Vec<LogicalBlockIdx> = self.runs.iter().map(|&(head, _)| head).collect();
        let log_idx =
            self.write
                .log_mgr
                .append(allocator, self.vb, self.num_blocks, &heads)?;
        TxEntry::indirect_commit(self.num_blocks, log_idx)
            .ok_or(UlayfsError::InvalidArgument("write spans too many blocks"))
    }

    /// The unaligned commit loop: every conflicting entry between the
    /// failed slot and the final home is checked against the partial
    /// edges, and an overlapped edge is recopied from the refreshed
    /// projection before the retry.
    fn commit_with_edge_checks(
        &self,
        entry: TxEntry,
        cursor: &mut TxCursor,
        allocator: &mut Allocator,
    ) -> Result<()> {
        let copy_first = self.first_local != 0;
        let copy_last = self.last_end != BLOCK_SIZE;
        let last_vidx = VirtualBlockIdx(self.ve.0 - 1);

        loop {
            let Some(winner) = self
                .write
                .tx_mgr
                .try_commit(entry, cursor, allocator, false)?
            else {
                return Ok(());
            };

            let mut redo_first = false;
            let mut redo_last = false;
            if let Some((wvb, wnum)) = self.write.tx_mgr.commit_range(winner)? {
                let overlaps = |vidx: VirtualBlockIdx| {
                    wvb.0 <= vidx.0 && vidx.0 - wvb.0 < wnum
                };
                redo_first = copy_first && overlaps(self.vb);
                redo_last = copy_last && overlaps(last_vidx);
            }

            if redo_first || redo_last {
                debug!(
                    target: "ulayfs::cow",
                    vb = self.vb.0,
                    redo_first,
                    redo_last,
                    "conflicting entry overlaps a partial edge, recopying"
                );
                self.write.view.update()?;
                if redo_first {
                    let dst = self.write.ctx.mem.byte_block(self.dst_lbi(0))?;
                    self.copy_edge(&dst, self.vb, 0, self.first_local)?;
                    self.persist_range(self.dst_lbi(0), &dst, 0, self.first_local);
                }
                if redo_last {
                    let dst_idx = self.dst_lbi(self.num_blocks - 1);
                    let dst = self.write.ctx.mem.byte_block(dst_idx)?;
                    self.copy_edge(&dst, last_vidx, self.last_end, BLOCK_SIZE)?;
                    self.persist_range(dst_idx, &dst, self.last_end, BLOCK_SIZE);
                }
            }

            self.write.tx_mgr.advance(cursor, Some(allocator))?;
        }
    }

    fn persist_range(
        &self,
        lbi: LogicalBlockIdx,
        block: &ulayfs_pmem::ByteBlock,
        lo: usize,
        hi: usize,
    ) {
        let guard = block.read();
        self.write.ctx.persist.persist(lbi, lo, &guard[lo..hi]);
    }

    /// Destination block for write-relative block `i`.
    fn dst_lbi(&self, i: u32) -> LogicalBlockIdx {
        let (head, len) = self.runs[(i / BITMAP_WORD_CAPACITY) as usize];
        debug_assert!(i % BITMAP_WORD_CAPACITY < len);
        LogicalBlockIdx(head.0 + i % BITMAP_WORD_CAPACITY)
    }
}

/// Allocate `num_blocks` destination blocks as runs of at most 64. All
/// already-allocated runs return to the free lists if a later run fails.
fn alloc_runs(
    allocator: &mut Allocator,
    ctx: &FsContext,
    num_blocks: u32,
) -> Result<Vec<(LogicalBlockIdx, u32)>> {
    let mut runs = Vec::with_capacity(num_blocks.div_ceil(BITMAP_WORD_CAPACITY) as usize);
    let mut left = num_blocks;
    while left > 0 {
        let n = left.min(BITMAP_WORD_CAPACITY);
        match allocator.alloc(ctx, n) {
            Ok(head) => runs.push((head, n)),
            Err(err) => {
                for (head, len) in runs {
                    allocator.free(head, len);
                }
                return Err(err);
            }
        }
        left -= n;
    }
    Ok(runs)
}
