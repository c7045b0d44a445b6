#![forbid(unsafe_code)]
//! Per-thread block allocation.
//!
//! Each thread owns an [`Allocator`]: 64 free lists of exact-length runs
//! plus a cursor into its current log-entry block. Runs enter the free
//! lists either by splitting a longer run or by reserving a whole bitmap
//! word — the CAS takes every free bit of the word and the surplus runs
//! are banked locally. Frees never touch the bitmap; blocks return to the
//! free list of their run length and only recovery clears bits.
//!
//! ## Design
//!
//! 1. `alloc(n)` — exact list, then smallest longer run, then a bitmap
//!    word pull with zero-run enumeration.
//! 2. `free` / `free_image` — exact-length push, optionally folding a
//!    projection image into maximal consecutive runs.
//! 3. `reserve_log_entry` — fragment placement for one log entry in the
//!    thread's append-only log-entry region.

use std::sync::Arc;
use tracing::trace;
use ulayfs_error::{Result, UlayfsError};
use ulayfs_pmem::{ByteBlock, FsContext};
use ulayfs_types::{
    BITMAP_WORD_CAPACITY, BLOCK_SIZE, LOG_ENTRY_HEADER_SIZE, LOG_ENTRY_MIN_SIZE, LogEntryIdx,
    LogicalBlockIdx, log_entry_lidx_count,
};

/// A reserved slot for one log entry fragment. The log manager writes the
/// fragment bytes; chaining to the following slot is derived from the slot
/// order.
#[derive(Debug, Clone)]
pub struct LogFragmentSlot {
    pub idx: LogEntryIdx,
    pub block: Arc<ByteBlock>,
    /// Blocks covered by this fragment.
    pub num_blocks: u32,
}

/// Per-thread allocator state. Not shared: the owning thread locks its own
/// entry in the file's registry.
#[derive(Debug)]
pub struct Allocator {
    /// `free_lists[k]` holds runs of exactly `k + 1` blocks.
    free_lists: [Vec<LogicalBlockIdx>; BITMAP_WORD_CAPACITY as usize],
    /// Bitmap word to try first on the next pull.
    recent_word: usize,
    /// Current log-entry block and append offset.
    log_block: Option<(LogicalBlockIdx, Arc<ByteBlock>)>,
    log_offset: usize,
}

impl Default for Allocator {
    fn default() -> Self {
        Self {
            free_lists: core::array::from_fn(|_| Vec::new()),
            recent_word: 0,
            log_block: None,
            log_offset: 0,
        }
    }
}

impl Allocator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate `n` consecutive blocks, `1 ≤ n ≤ 64`.
    pub fn alloc(&mut self, ctx: &FsContext, n: u32) -> Result<LogicalBlockIdx> {
        assert!(
            (1..=BITMAP_WORD_CAPACITY).contains(&n),
            "run length {n} out of range"
        );
        let want = (n - 1) as usize;

        if let Some(lidx) = self.free_lists[want].pop() {
            trace!(target: "ulayfs::alloc", n, lidx = lidx.0, "alloc from exact free list");
            return Ok(lidx);
        }

        // Smallest longer run, first n blocks consumed, tail re-banked.
        for longer in (n + 1)..=BITMAP_WORD_CAPACITY {
            if let Some(lidx) = self.free_lists[(longer - 1) as usize].pop() {
                self.free_lists[(longer - n - 1) as usize]
                    .push(LogicalBlockIdx(lidx.0 + n));
                trace!(
                    target: "ulayfs::alloc",
                    n,
                    lidx = lidx.0,
                    split_from = longer,
                    "alloc by splitting a longer run"
                );
                return Ok(lidx);
            }
        }

        // Pull whole words from the global bitmap until one of them holds
        // a long enough zero run.
        loop {
            let Some((word_idx, prev_bits)) = ctx.bitmap.try_reserve_from(self.recent_word)
            else {
                return Err(UlayfsError::OutOfSpace);
            };
            ctx.bitmap.persist_word(word_idx, ctx.persist.as_ref());
            self.recent_word = word_idx + 1;

            let base = ctx.bitmap.word_base_block(word_idx);
            let mut found = None;
            for (bit, len) in zero_runs(prev_bits) {
                let run = LogicalBlockIdx(base.0 + bit);
                if found.is_none() && len >= n {
                    found = Some(run);
                    if len > n {
                        self.free_lists[(len - n - 1) as usize]
                            .push(LogicalBlockIdx(run.0 + n));
                    }
                } else {
                    self.free_lists[(len - 1) as usize].push(run);
                }
            }
            if let Some(lidx) = found {
                trace!(
                    target: "ulayfs::alloc",
                    n,
                    lidx = lidx.0,
                    word = word_idx,
                    "alloc from bitmap word"
                );
                return Ok(lidx);
            }
        }
    }

    /// Return a run to its free list. The bitmap bit stays set; merging
    /// with neighbouring free runs is not attempted.
    pub fn free(&mut self, lidx: LogicalBlockIdx, n: u32) {
        if lidx.is_null() || n == 0 {
            return;
        }
        debug_assert!(n <= BITMAP_WORD_CAPACITY);
        trace!(target: "ulayfs::alloc", lidx = lidx.0, n, "free run");
        self.free_lists[(n - 1) as usize].push(lidx);
    }

    /// Fold a projection image (per-vidx current block, zero for holes)
    /// into free runs: consecutive indices that are also numerically
    /// consecutive collapse into one entry; holes break runs.
    pub fn free_image(&mut self, image: &[LogicalBlockIdx]) {
        let mut run_start: Option<LogicalBlockIdx> = None;
        let mut run_len = 0_u32;
        for &lidx in image {
            match run_start {
                Some(start) if lidx.0 == start.0 + run_len && run_len < BITMAP_WORD_CAPACITY => {
                    run_len += 1;
                }
                _ => {
                    if let Some(start) = run_start {
                        self.free(start, run_len);
                    }
                    run_start = (!lidx.is_null()).then_some(lidx);
                    run_len = u32::from(!lidx.is_null());
                }
            }
        }
        if let Some(start) = run_start {
            self.free(start, run_len);
        }
    }

    /// Count of runs currently banked for length `n`.
    #[must_use]
    pub fn free_run_count(&self, n: u32) -> usize {
        self.free_lists[(n - 1) as usize].len()
    }

    /// Reserve space for one log entry describing `num_blocks` blocks,
    /// chaining fragments across log-entry blocks as needed. Returns the
    /// slots in chain order; the first slot's locator identifies the
    /// entry.
    pub fn reserve_log_entry(
        &mut self,
        ctx: &FsContext,
        num_blocks: u32,
    ) -> Result<Vec<LogFragmentSlot>> {
        debug_assert!(num_blocks > 0);
        if self.log_block.is_none() || BLOCK_SIZE - self.log_offset < LOG_ENTRY_MIN_SIZE {
            self.open_log_block(ctx)?;
        }

        let mut slots = Vec::new();
        let mut needed_lidxs = log_entry_lidx_count(num_blocks);
        let mut remaining_blocks = num_blocks;
        loop {
            let (lbi, block) = self
                .log_block
                .clone()
                .expect("log block is open while reserving");
            let header_end = self.log_offset + LOG_ENTRY_HEADER_SIZE;
            let avail_lidxs = ((BLOCK_SIZE - header_end) / 4) as u32;
            debug_assert!(avail_lidxs > 0);

            if needed_lidxs <= avail_lidxs {
                slots.push(LogFragmentSlot {
                    idx: LogEntryIdx {
                        block_idx: lbi,
                        local_offset: self.log_offset as u16,
                    },
                    block,
                    num_blocks: remaining_blocks,
                });
                self.log_offset = header_end + (needed_lidxs * 4) as usize;
                return Ok(slots);
            }

            let covered = avail_lidxs * BITMAP_WORD_CAPACITY;
            slots.push(LogFragmentSlot {
                idx: LogEntryIdx {
                    block_idx: lbi,
                    local_offset: self.log_offset as u16,
                },
                block,
                num_blocks: covered,
            });
            needed_lidxs -= avail_lidxs;
            remaining_blocks -= covered;
            self.log_offset = header_end + (avail_lidxs * 4) as usize;

            debug_assert!(self.log_offset <= BLOCK_SIZE);
            if BLOCK_SIZE - self.log_offset < LOG_ENTRY_MIN_SIZE {
                self.open_log_block(ctx)?;
            }
        }
    }

    fn open_log_block(&mut self, ctx: &FsContext) -> Result<()> {
        let lbi = self.alloc(ctx, 1)?;
        let block = ctx.mem.byte_block(lbi)?;
        trace!(target: "ulayfs::alloc", lidx = lbi.0, "fresh log-entry block");
        self.log_block = Some((lbi, block));
        self.log_offset = 0;
        Ok(())
    }
}

/// Enumerate the zero runs of a bitmap word as `(bit, length)` pairs, in
/// low-to-high bit order, by alternating trailing-ones/trailing-zeros
/// counts over the captured pre-CAS value.
#[must_use]
pub fn zero_runs(word: u64) -> Vec<(u32, u32)> {
    let mut runs = Vec::new();
    let mut bits = word;
    let mut consumed = 0_u32;
    while consumed < BITMAP_WORD_CAPACITY {
        let ones = bits.trailing_ones().min(BITMAP_WORD_CAPACITY - consumed);
        bits = shift_out(bits, ones);
        consumed += ones;
        if consumed >= BITMAP_WORD_CAPACITY {
            break;
        }
        let zeros = bits.trailing_zeros().min(BITMAP_WORD_CAPACITY - consumed);
        runs.push((consumed, zeros));
        bits = shift_out(bits, zeros);
        consumed += zeros;
    }
    runs
}

fn shift_out(bits: u64, count: u32) -> u64 {
    if count >= 64 { 0 } else { bits >> count }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use ulayfs_pmem::{BitmapSet, MemTable, MetaBlock, NullPersist};

    fn test_ctx(num_blocks: u32) -> FsContext {
        let persist: Arc<dyn ulayfs_pmem::Persist> = Arc::new(NullPersist);
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

    // ── zero-run enumeration ────────────────────────────────────────────

    #[test]
    fn zero_runs_of_empty_word() {
        assert_eq!(zero_runs(0), vec![(0, 64)]);
    }

    #[test]
    fn zero_runs_of_full_word() {
        assert_eq!(zero_runs(u64::MAX), vec![]);
    }

    #[test]
    fn zero_runs_alternating() {
        // bits 0..3 set, 4..9 free, 10..11 set, 12..63 free
        let word = 0b1100_0000_1111_u64;
        assert_eq!(zero_runs(word), vec![(4, 6), (12, 52)]);
    }

    #[test]
    fn zero_runs_leading_free() {
        // Only the top bit set.
        let word = 1_u64 << 63;
        assert_eq!(zero_runs(word), vec![(0, 63)]);
    }

    // ── allocation ──────────────────────────────────────────────────────

    #[test]
    fn alloc_skips_reserved_meta_block() {
        let ctx = test_ctx(256);
        let mut alloc = Allocator::new();
        let lidx = alloc.alloc(&ctx, 1).expect("alloc");
        // Block 0 is the meta block; the first data block is 1.
        assert_eq!(lidx, LogicalBlockIdx(1));
    }

    #[test]
    fn alloc_consecutive_run() {
        let ctx = test_ctx(256);
        let mut alloc = Allocator::new();
        let run = alloc.alloc(&ctx, 8).expect("alloc 8");
        assert_eq!(run, LogicalBlockIdx(1));
        // The next single block comes right after the carved run.
        let next = alloc.alloc(&ctx, 1).expect("alloc 1");
        assert_eq!(next, LogicalBlockIdx(9));
    }

    #[test]
    fn freed_run_is_recycled_exactly() {
        // Allocate 63 singles from a fresh word, free the middle one, and
        // expect the next single allocation to return it.
        let ctx = test_ctx(256);
        let mut alloc = Allocator::new();
        let mut got = Vec::new();
        for _ in 0..63 {
            got.push(alloc.alloc(&ctx, 1).expect("alloc"));
        }
        let middle = got[31];
        alloc.free(middle, 1);
        assert_eq!(alloc.alloc(&ctx, 1).expect("alloc"), middle);
    }

    #[test]
    fn out_of_space_after_full_wrap() {
        let ctx = test_ctx(64);
        let mut alloc = Allocator::new();
        // 63 usable blocks (block 0 is the meta block).
        for _ in 0..63 {
            alloc.alloc(&ctx, 1).expect("alloc");
        }
        assert!(matches!(alloc.alloc(&ctx, 1), Err(UlayfsError::OutOfSpace)));
    }

    #[test]
    fn splitting_prefers_smallest_longer_run() {
        let ctx = test_ctx(256);
        let mut alloc = Allocator::new();
        alloc.free(LogicalBlockIdx(100), 16);
        alloc.free(LogicalBlockIdx(200), 4);
        // A 3-block request should split the 4-run, not the 16-run.
        let lidx = alloc.alloc(&ctx, 3).expect("alloc");
        assert_eq!(lidx, LogicalBlockIdx(200));
        assert_eq!(alloc.free_run_count(1), 1);
        assert_eq!(alloc.free_run_count(16), 1);
    }

    // ── recycle image folding ───────────────────────────────────────────

    #[test]
    fn free_image_folds_consecutive_runs() {
        let mut alloc = Allocator::new();
        let image: Vec<LogicalBlockIdx> = [10, 11, 12, 0, 20, 30, 31]
            .into_iter()
            .map(LogicalBlockIdx)
            .collect();
        alloc.free_image(&image);
        assert_eq!(alloc.free_run_count(3), 1);
        assert_eq!(alloc.free_run_count(1), 1);
        assert_eq!(alloc.free_run_count(2), 1);
    }

    #[test]
    fn free_image_all_holes_is_noop() {
        let mut alloc = Allocator::new();
        alloc.free_image(&[LogicalBlockIdx(0); 4]);
        for n in 1..=64 {
            assert_eq!(alloc.free_run_count(n), 0);
        }
    }

    // ── log entry reservation ───────────────────────────────────────────

    #[test]
    fn small_entry_fits_one_fragment() {
        let ctx = test_ctx(256);
        let mut alloc = Allocator::new();
        let slots = alloc.reserve_log_entry(&ctx, 3).expect("reserve");
        assert_eq!(slots.len(), 1);
        assert_eq!(slots[0].num_blocks, 3);
        assert_eq!(slots[0].idx.local_offset, 0);

        // A second reservation lands right after the first (header + one
        // index word).
        let slots = alloc.reserve_log_entry(&ctx, 1).expect("reserve");
        assert_eq!(slots[0].idx.local_offset, 16);
    }

    #[test]
    fn giant_entry_chains_across_blocks() {
        let ctx = test_ctx(8192);
        let mut alloc = Allocator::new();
        // 1021 index slots fit one empty block ((4096 - 12) / 4); ask for
        // more than 1021 * 64 blocks so the entry must chain.
        let num_blocks = 1022 * 64;
        let slots = alloc.reserve_log_entry(&ctx, num_blocks).expect("reserve");
        assert_eq!(slots.len(), 2);
        assert_eq!(slots[0].num_blocks, 1021 * 64);
        assert_eq!(slots[1].num_blocks, 64);
        assert_ne!(slots[0].idx.block_idx, slots[1].idx.block_idx);
        assert_eq!(slots[1].idx.local_offset, 0);
        assert_eq!(
            slots.iter().map(|s| s.num_blocks).sum::<u32>(),
            num_blocks
        );
    }

    #[test]
    fn exhausted_tail_rolls_to_fresh_block() {
        let ctx = test_ctx(256);
        let mut alloc = Allocator::new();
        // Fill the block to within one minimum entry of the end.
        let mut last = None;
        for _ in 0..255 {
            last = Some(alloc.reserve_log_entry(&ctx, 1).expect("reserve"));
        }
        let last = last.expect("reservations happened");
        // 255 entries * 16 bytes = 4080; 16 bytes remain, exactly minimum.
        assert_eq!(last[0].idx.local_offset, 254 * 16);
        let next = alloc.reserve_log_entry(&ctx, 1).expect("reserve");
        assert_eq!(next[0].idx.local_offset, 255 * 16);
        // The block is now full; the next reservation opens a new one.
        let rolled = alloc.reserve_log_entry(&ctx, 1).expect("reserve");
        assert_eq!(rolled[0].idx.local_offset, 0);
        assert_ne!(rolled[0].idx.block_idx, next[0].idx.block_idx);
    }
}
