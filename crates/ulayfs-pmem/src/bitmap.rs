//! Persistent allocation bitmaps.
//!
//! One [`BitmapWord`] covers 64 consecutive blocks; bit *i* set means the
//! block is allocated. Words flip 0→1 only through a whole-word CAS that
//! takes every free bit at once (the winning allocator owns all of them
//! and keeps the surplus on its local free lists); bits flip 1→0 only on a
//! committed free or during recovery.
//!
//! The first 16,384 blocks are covered by 32 cache lines of words inline
//! in the meta block; each later range of 32,768 blocks starts with a
//! dedicated bitmap block whose own first bit is set at initialization.

use crate::persist::Persist;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;
use ulayfs_error::{Result, UlayfsError};
use ulayfs_types::{
    BITMAP_BLOCK_CAPACITY, BITMAP_WORD_CAPACITY, BITMAP_WORD_SHIFT, INLINE_BITMAP_CAPACITY,
    LogicalBlockIdx, META_INLINE_BITMAP_OFFSET, NUM_BITMAP_BLOCK_WORDS, NUM_INLINE_BITMAP_WORDS,
    read_le_u64,
};

/// Bounded CAS retries before a contended word is skipped.
const RESERVE_RETRIES: u32 = 4;

/// A 64-bit persistent allocation word.
#[derive(Debug, Default)]
pub struct BitmapWord(AtomicU64);

impl BitmapWord {
    /// Reserve every free bit of this word in one CAS.
    ///
    /// Returns the pre-CAS value on success so the caller can enumerate
    /// the zero runs it now owns. Fails when the word is already full or
    /// stays contended past the retry bound.
    pub fn try_reserve_free(&self) -> Option<u64> {
        let mut current = self.0.load(Ordering::Relaxed);
        for _ in 0..RESERVE_RETRIES {
            if current == u64::MAX {
                return None;
            }
            match self.0.compare_exchange_weak(
                current,
                u64::MAX,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(prev) => return Some(prev),
                Err(observed) => current = observed,
            }
        }
        None
    }

    /// Clear `len` bits starting at `bit`. Recovery and committed frees
    /// only.
    pub fn clear_range(&self, bit: u32, len: u32) {
        debug_assert!(bit + len <= BITMAP_WORD_CAPACITY);
        let mask = run_mask(bit, len);
        self.0.fetch_and(!mask, Ordering::AcqRel);
    }

    /// Set `len` bits starting at `bit`. Initialization only; regular
    /// allocation goes through `try_reserve_free`.
    pub fn set_range(&self, bit: u32, len: u32) {
        debug_assert!(bit + len <= BITMAP_WORD_CAPACITY);
        let mask = run_mask(bit, len);
        self.0.fetch_or(mask, Ordering::AcqRel);
    }

    #[must_use]
    pub fn is_set(&self, bit: u32) -> bool {
        debug_assert!(bit < BITMAP_WORD_CAPACITY);
        self.0.load(Ordering::Acquire) & (1 << bit) != 0
    }

    #[must_use]
    pub fn value(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    fn store(&self, value: u64) {
        self.0.store(value, Ordering::Relaxed);
    }
}

fn run_mask(bit: u32, len: u32) -> u64 {
    if len == BITMAP_WORD_CAPACITY {
        u64::MAX
    } else {
        ((1_u64 << len) - 1) << bit
    }
}

/// One contiguous bitmap region: the inline words or a bitmap block.
#[derive(Debug)]
struct BitmapRegion {
    /// Block the words persist into.
    persist_block: LogicalBlockIdx,
    /// Byte offset of word 0 within that block.
    persist_base: usize,
    /// First block covered by bit 0 of word 0.
    first_block: u32,
    words: Box<[BitmapWord]>,
}

/// All bitmap words of a file, indexed globally in layout order.
#[derive(Debug)]
pub struct BitmapSet {
    regions: Vec<BitmapRegion>,
    total_words: usize,
    num_blocks: u32,
}

impl BitmapSet {
    /// Build the zeroed word set for a file of `num_blocks` blocks.
    /// Coverage beyond `num_blocks` is sealed with guard bits so the
    /// allocator can never hand out blocks past the end of the file.
    #[must_use]
    pub fn new(num_blocks: u32) -> Self {
        let mut regions = Vec::new();
        regions.push(BitmapRegion {
            persist_block: LogicalBlockIdx::META,
            persist_base: META_INLINE_BITMAP_OFFSET,
            first_block: 0,
            words: make_words(NUM_INLINE_BITMAP_WORDS),
        });

        let mut covered = u64::from(INLINE_BITMAP_CAPACITY);
        while covered < u64::from(num_blocks) {
            #[allow(clippy::cast_possible_truncation)] // covered < num_blocks ≤ u32::MAX here
            let first_block = covered as u32;
            regions.push(BitmapRegion {
                persist_block: LogicalBlockIdx(first_block),
                persist_base: 0,
                first_block,
                words: make_words(NUM_BITMAP_BLOCK_WORDS),
            });
            covered += u64::from(BITMAP_BLOCK_CAPACITY);
        }

        let total_words = regions.iter().map(|r| r.words.len()).sum();
        let set = Self {
            regions,
            total_words,
            num_blocks,
        };
        set.seal_guard_bits();
        set
    }

    /// Rebuild the word set from a file image.
    pub fn decode(image: &[u8], num_blocks: u32) -> Result<Self> {
        let set = Self::new(num_blocks);
        for region in &set.regions {
            let base = region.persist_block.byte_offset() as usize + region.persist_base;
            for (w, word) in region.words.iter().enumerate() {
                let value = read_le_u64(image, base + w * 8).map_err(|err| {
                    UlayfsError::CorruptImage {
                        detail: format!("bitmap word {w} of block {}: {err}", region.persist_block),
                    }
                })?;
                word.store(word.value() | value);
            }
        }
        Ok(set)
    }

    /// Mark the layout-reserved blocks (meta block, bitmap blocks) as
    /// allocated and persist the touched words. Called once at create.
    pub fn init_reserved(&self, persist: &dyn Persist) {
        self.set_allocated(LogicalBlockIdx::META, persist);
        for region in self.regions.iter().skip(1) {
            self.set_allocated(LogicalBlockIdx(region.first_block), persist);
        }
    }

    /// Blocks addressable by this set (file capacity).
    #[must_use]
    pub fn capacity_blocks(&self) -> u32 {
        self.num_blocks
    }

    #[must_use]
    pub fn word_count(&self) -> usize {
        self.total_words
    }

    /// Whether `lbi` is a layout-reserved block (meta or bitmap block).
    #[must_use]
    pub fn is_reserved(&self, lbi: LogicalBlockIdx) -> bool {
        lbi.is_null()
            || self
                .regions
                .iter()
                .skip(1)
                .any(|r| r.first_block == lbi.0)
    }

    /// Sweep the words from `hint`, wrapping once, and reserve the first
    /// word with free bits. Returns the global word index and the pre-CAS
    /// value.
    pub fn try_reserve_from(&self, hint: usize) -> Option<(usize, u64)> {
        let hint = if hint >= self.total_words { 0 } else { hint };
        let sweep = (hint..self.total_words).chain(0..hint);
        for idx in sweep {
            if let Some(prev) = self.word(idx).try_reserve_free() {
                trace!(target: "ulayfs::alloc", word = idx, bits = format_args!("{prev:#018x}"), "bitmap word reserved");
                return Some((idx, prev));
            }
        }
        None
    }

    /// The word at a global index.
    #[must_use]
    pub fn word(&self, idx: usize) -> &BitmapWord {
        let (region, local) = self.locate_word(idx);
        &self.regions[region].words[local]
    }

    /// First block covered by the word at a global index.
    #[must_use]
    pub fn word_base_block(&self, idx: usize) -> LogicalBlockIdx {
        let (region, local) = self.locate_word(idx);
        LogicalBlockIdx(self.regions[region].first_block + (local as u32) * BITMAP_WORD_CAPACITY)
    }

    /// Persist the current value of the word at a global index.
    pub fn persist_word(&self, idx: usize, persist: &dyn Persist) {
        let (region_idx, local) = self.locate_word(idx);
        let region = &self.regions[region_idx];
        let bytes = region.words[local].value().to_le_bytes();
        persist.persist(region.persist_block, region.persist_base + local * 8, &bytes);
    }

    /// Whether the bit for `lbi` is set.
    #[must_use]
    pub fn is_allocated(&self, lbi: LogicalBlockIdx) -> bool {
        let (word_idx, bit) = self.locate_block(lbi);
        self.word(word_idx).is_set(bit)
    }

    /// Set the bit for `lbi` and persist its word. Initialization only.
    pub fn set_allocated(&self, lbi: LogicalBlockIdx, persist: &dyn Persist) {
        let (word_idx, bit) = self.locate_block(lbi);
        self.word(word_idx).set_range(bit, 1);
        self.persist_word(word_idx, persist);
    }

    /// Clear the bits for `n` blocks starting at `lbi` and persist the
    /// touched words. Recovery only.
    pub fn clear_run(&self, lbi: LogicalBlockIdx, n: u32, persist: &dyn Persist) {
        let mut remaining = n;
        let mut block = lbi;
        while remaining > 0 {
            let (word_idx, bit) = self.locate_block(block);
            let len = remaining.min(BITMAP_WORD_CAPACITY - bit);
            self.word(word_idx).clear_range(bit, len);
            self.persist_word(word_idx, persist);
            remaining -= len;
            block = LogicalBlockIdx(block.0 + len);
        }
    }

    fn locate_word(&self, idx: usize) -> (usize, usize) {
        assert!(idx < self.total_words, "bitmap word index {idx} out of range");
        if idx < NUM_INLINE_BITMAP_WORDS {
            return (0, idx);
        }
        let rest = idx - NUM_INLINE_BITMAP_WORDS;
        let region = 1 + rest / NUM_BITMAP_BLOCK_WORDS;
        (region, rest % NUM_BITMAP_BLOCK_WORDS)
    }

    fn locate_block(&self, lbi: LogicalBlockIdx) -> (usize, u32) {
        assert!(
            lbi.0 < self.num_blocks,
            "block index {lbi} beyond file capacity {}",
            self.num_blocks
        );
        if lbi.0 < INLINE_BITMAP_CAPACITY {
            return ((lbi.0 >> BITMAP_WORD_SHIFT) as usize, lbi.0 & 63);
        }
        let rest = lbi.0 - INLINE_BITMAP_CAPACITY;
        let region = 1 + (rest / BITMAP_BLOCK_CAPACITY) as usize;
        let in_region = rest % BITMAP_BLOCK_CAPACITY;
        let word = NUM_INLINE_BITMAP_WORDS
            + (region - 1) * NUM_BITMAP_BLOCK_WORDS
            + (in_region >> BITMAP_WORD_SHIFT) as usize;
        (word, in_region & 63)
    }

    /// Set the bits past `num_blocks` so partially covered tail words can
    /// never satisfy an allocation.
    fn seal_guard_bits(&self) {
        let coverage = u64::from(INLINE_BITMAP_CAPACITY)
            + (self.regions.len() as u64 - 1) * u64::from(BITMAP_BLOCK_CAPACITY);
        let mut block = u64::from(self.num_blocks);
        while block < coverage {
            let (word_idx, bit) = self.locate_guard(block);
            let len = u64::from(BITMAP_WORD_CAPACITY - bit).min(coverage - block);
            #[allow(clippy::cast_possible_truncation)] // len ≤ 64
            self.word(word_idx).set_range(bit, len as u32);
            block += len;
        }
    }

    // Like `locate_block` but allowed past `num_blocks` (guard region).
    #[allow(clippy::cast_possible_truncation)] // word indexes fit usize, bit offsets < 64
    fn locate_guard(&self, block: u64) -> (usize, u32) {
        if block < u64::from(INLINE_BITMAP_CAPACITY) {
            return ((block >> BITMAP_WORD_SHIFT) as usize, (block & 63) as u32);
        }
        let rest = block - u64::from(INLINE_BITMAP_CAPACITY);
        let region = (rest / u64::from(BITMAP_BLOCK_CAPACITY)) as usize;
        let in_region = rest % u64::from(BITMAP_BLOCK_CAPACITY);
        (
            NUM_INLINE_BITMAP_WORDS
                + region * NUM_BITMAP_BLOCK_WORDS
                + (in_region >> BITMAP_WORD_SHIFT) as usize,
            (in_region & 63) as u32,
        )
    }
}

fn make_words(count: usize) -> Box<[BitmapWord]> {
    (0..count).map(|_| BitmapWord::default()).collect()
}
