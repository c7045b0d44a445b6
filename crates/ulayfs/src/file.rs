//! One open layered file: subsystem wiring, open-time recovery, and the
//! positional read/write surface.

use crate::blk_table::BlkTable;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::thread::ThreadId;
use tracing::{debug, info};
use ulayfs_alloc::Allocator;
use ulayfs_error::{Result, UlayfsError};
use ulayfs_pmem::{
    BitmapSet, FilePersist, FsContext, MemTable, MetaBlock, NullPersist, Persist, TxEntryKind,
};
use ulayfs_tx::{LogMgr, TxCursor, TxMgr, WriteCtx, do_pwrite};
use ulayfs_types::{
    BLOCK_SIZE, LogicalBlockIdx, block_local_offset, byte_to_vidx, covering_block_range,
};

/// Default preallocation: 16,384 blocks (64 MiB), exactly the inline
/// bitmap's coverage.
pub const DEFAULT_PREALLOC_BLOCKS: u32 = 16_384;

/// An open layered file.
pub struct File {
    ctx: FsContext,
    tx_mgr: TxMgr,
    log_mgr: LogMgr,
    blk_table: BlkTable,
    /// Per-thread allocators; each thread only ever locks its own.
    allocators: Mutex<HashMap<ThreadId, Arc<Mutex<Allocator>>>>,
}

impl File {
    /// Create a fresh layered file over `persist`, presized to
    /// `num_blocks` blocks.
    pub fn create(num_blocks: u32, persist: Arc<dyn Persist>) -> Result<Self> {
        if num_blocks < 2 {
            return Err(UlayfsError::InvalidArgument(
                "a layered file needs at least two blocks",
            ));
        }
        let meta = Arc::new(MetaBlock::create(num_blocks, persist.as_ref()));
        let bitmap = Arc::new(BitmapSet::new(num_blocks));
        bitmap.init_reserved(persist.as_ref());
        let ctx = FsContext {
            meta,
            mem: Arc::new(MemTable::new(num_blocks)),
            bitmap,
            persist,
        };
        info!(target: "ulayfs::file", num_blocks, "layered file created");
        Ok(Self::wire(ctx))
    }

    /// Create a volatile in-memory file. Test and tooling entry point.
    pub fn create_volatile(num_blocks: u32) -> Result<Self> {
        Self::create(num_blocks, Arc::new(NullPersist))
    }

    /// Create a layered file at `path`, presized to `num_blocks`.
    pub fn create_at(path: &Path, num_blocks: u32) -> Result<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        file.set_len(u64::from(num_blocks) * BLOCK_SIZE as u64)?;
        Self::create(num_blocks, Arc::new(FilePersist::new(file)))
    }

    /// Open an existing image and replay the log for recovery.
    ///
    /// Aborts on a signature mismatch: a non-empty file without the magic
    /// must never be served as this layout. The shim probes the signature
    /// first and falls back to passthrough for foreign files.
    pub fn open_image(image: Vec<u8>, persist: Arc<dyn Persist>) -> Result<Self> {
        let meta = Arc::new(MetaBlock::decode(&image)?);
        let num_blocks = meta.num_blocks();
        if u64::from(num_blocks) * BLOCK_SIZE as u64 > image.len() as u64 {
            return Err(UlayfsError::CorruptImage {
                detail: format!(
                    "meta block claims {num_blocks} blocks but the image has {} bytes",
                    image.len()
                ),
            });
        }
        let bitmap = Arc::new(BitmapSet::decode(&image, num_blocks)?);
        let ctx = FsContext {
            meta,
            mem: Arc::new(MemTable::from_image(image, num_blocks)),
            bitmap,
            persist,
        };
        let file = Self::wire(ctx);
        file.recover()?;
        file.ctx.mem.release_image();
        Ok(file)
    }

    /// Open the layered file at `path`.
    pub fn open_at(path: &Path) -> Result<Self> {
        let image = std::fs::read(path)?;
        let file = std::fs::OpenOptions::new().read(true).write(true).open(path)?;
        Self::open_image(image, Arc::new(FilePersist::new(file)))
    }

    fn wire(ctx: FsContext) -> Self {
        let tx_mgr = TxMgr::new(ctx.clone());
        let log_mgr = LogMgr::new(ctx.clone());
        let blk_table = BlkTable::new(tx_mgr.clone(), log_mgr.clone());
        Self {
            ctx,
            tx_mgr,
            log_mgr,
            blk_table,
            allocators: Mutex::new(HashMap::new()),
        }
    }

    /// Logical file size in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.ctx.meta.file_size()
    }

    /// Physical capacity in blocks.
    #[must_use]
    pub fn capacity_blocks(&self) -> u32 {
        self.ctx.meta.num_blocks()
    }

    /// Positional read: project the log onto the covered range and copy
    /// out, clamped to the logical file size. Holes read as zeros.
    pub fn pread(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let size = self.ctx.meta.file_size();
        if offset >= size || buf.is_empty() {
            return Ok(0);
        }
        let count = (buf.len() as u64).min(size - offset) as usize;
        self.blk_table.update_with(None)?;

        let (vb, ve) = covering_block_range(offset, count as u64);
        let lidxs = self.blk_table.lookup_range(vb, ve.0 - vb.0);

        let mut copied = 0_usize;
        while copied < count {
            let pos = offset + copied as u64;
            let local = block_local_offset(pos);
            let take = (BLOCK_SIZE - local).min(count - copied);
            let vidx = byte_to_vidx(pos);
            let lidx = lidxs[(vidx.0 - vb.0) as usize];
            if lidx.is_null() {
                buf[copied..copied + take].fill(0);
            } else {
                let block = self.ctx.mem.byte_block(lidx)?;
                block.copy_to(local, &mut buf[copied..copied + take]);
            }
            copied += take;
        }
        Ok(count)
    }

    /// Positional write through the copy-on-write path. Atomic at the
    /// transaction level: concurrent writers serialize through the tx
    /// log, last committed entry wins per block.
    pub fn pwrite(&self, buf: &[u8], offset: u64) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let end = offset
            .checked_add(buf.len() as u64)
            .ok_or(UlayfsError::InvalidArgument("write range overflows"))?;
        if end > (u64::from(u32::MAX) + 1) * BLOCK_SIZE as u64 {
            return Err(UlayfsError::InvalidArgument(
                "write range exceeds the virtual index space",
            ));
        }

        let allocator = self.thread_allocator();
        let mut allocator = allocator.lock();
        let write = WriteCtx {
            ctx: &self.ctx,
            tx_mgr: &self.tx_mgr,
            log_mgr: &self.log_mgr,
            view: &self.blk_table,
        };
        do_pwrite(write, &mut allocator, buf, offset)?;

        self.ctx
            .meta
            .grow_file_size(end, self.ctx.persist.as_ref());
        // Fold the blocks this commit replaced into our free lists.
        self.blk_table.update_with(Some(&mut allocator))?;
        Ok(buf.len())
    }

    /// The calling thread's allocator, created on first use.
    fn thread_allocator(&self) -> Arc<Mutex<Allocator>> {
        let tid = std::thread::current().id();
        Arc::clone(
            self.allocators
                .lock()
                .entry(tid)
                .or_insert_with(|| Arc::new(Mutex::new(Allocator::new()))),
        )
    }

    // ── Open-time recovery ──────────────────────────────────────────────

    /// Walk the installed log, validating sequence numbers and the
    /// bitmap/log consistency invariant, then reclaim orphaned bits and
    /// restore the logical size.
    ///
    /// Two phases: the chain structure first, so every tx block holds its
    /// typed handle before entry replay can mistake a recycled index for
    /// data; then the entries themselves.
    fn recover(&self) -> Result<()> {
        let mut referenced: BTreeSet<u32> = BTreeSet::new();

        let mut chain_block = self.ctx.meta.next_tx_block();
        let mut prev_seq = 0_u32;
        while !chain_block.is_null() {
            self.check_referenced_run(&mut referenced, chain_block, 1)?;
            let block = self.ctx.mem.tx_block(chain_block)?;
            if block.seq() != prev_seq + 1 {
                return Err(UlayfsError::CorruptImage {
                    detail: format!(
                        "tx chain sequence jumps from {prev_seq} to {} at block {chain_block}",
                        block.seq()
                    ),
                });
            }
            prev_seq = block.seq();
            chain_block = block.next_block();
        }

        let mut cursor = TxCursor::start();
        let mut entries = 0_u64;
        let mut max_end_blocks = 0_u64;

        loop {
            let entry = self.tx_mgr.entry_at(&cursor);
            if entry.is_empty() {
                break;
            }
            entries += 1;
            match entry.kind() {
                TxEntryKind::InlineCommit {
                    vidx,
                    num_blocks,
                    lidx,
                } => {
                    self.check_referenced_run(&mut referenced, lidx, num_blocks)?;
                    self.materialize_data_run(lidx, num_blocks);
                    max_end_blocks = max_end_blocks.max(u64::from(vidx.0) + u64::from(num_blocks));
                }
                TxEntryKind::IndirectCommit { log_idx, .. } => {
                    let coverage = self.log_mgr.read_coverage(log_idx)?;
                    for &block in &coverage.entry_blocks {
                        self.check_referenced_run(&mut referenced, block, 1)?;
                    }
                    let mut left = coverage.num_blocks;
                    for &head in &coverage.run_heads {
                        let len = left.min(64);
                        self.check_referenced_run(&mut referenced, head, len)?;
                        self.materialize_data_run(head, len);
                        left -= len;
                    }
                    max_end_blocks = max_end_blocks
                        .max(u64::from(coverage.begin_vidx.0) + u64::from(coverage.num_blocks));
                }
                TxEntryKind::Begin => {}
                TxEntryKind::Empty => unreachable!("loop breaks on empty entries"),
            }

            if !self.tx_mgr.advance(&mut cursor, None)? {
                break;
            }
        }

        let reclaimed = self.reclaim_orphans(&referenced);
        // A committed write ending in block b proves the size passed
        // b's first byte. A persisted size below that floor means the
        // final size store raced a crash; restore the block-granular
        // bound, the best the log can prove.
        let size_floor = max_end_blocks
            .saturating_sub(1)
            .saturating_mul(BLOCK_SIZE as u64)
            + u64::from(max_end_blocks > 0);
        if self.ctx.meta.file_size() < size_floor {
            self.ctx
                .meta
                .restore_file_size(max_end_blocks * BLOCK_SIZE as u64, self.ctx.persist.as_ref());
        }
        // Rebuild the projection eagerly so every referenced data block is
        // materialized before the image is released.
        self.blk_table.update_with(None)?;

        info!(
            target: "ulayfs::file",
            entries,
            referenced = referenced.len(),
            reclaimed,
            "log replayed at open"
        );
        Ok(())
    }

    /// Every log-referenced block must have its bitmap bit set.
    fn check_referenced_run(
        &self,
        referenced: &mut BTreeSet<u32>,
        head: LogicalBlockIdx,
        len: u32,
    ) -> Result<()> {
        for i in 0..len {
            let lbi = LogicalBlockIdx(head.0 + i);
            if !self.ctx.mem.in_range(lbi) {
                return Err(UlayfsError::CorruptImage {
                    detail: format!("log references out-of-range block {lbi}"),
                });
            }
            if !self.ctx.bitmap.is_allocated(lbi) {
                return Err(UlayfsError::CorruptImage {
                    detail: format!("log references block {lbi} but its bitmap bit is clear"),
                });
            }
            referenced.insert(lbi.0);
        }
        Ok(())
    }

    /// Pull a committed data run out of the open-time image before it is
    /// released; later reads must not materialize these blocks zeroed.
    /// A run whose block now serves the tx chain belongs to a superseded
    /// entry and is skipped.
    fn materialize_data_run(&self, head: LogicalBlockIdx, len: u32) {
        for i in 0..len {
            let _ = self.ctx.mem.byte_block(LogicalBlockIdx(head.0 + i));
        }
    }

    /// Clear bits the log does not account for: allocator-private runs
    /// that were lost in flight. Returns the number of blocks reclaimed.
    fn reclaim_orphans(&self, referenced: &BTreeSet<u32>) -> u32 {
        let mut reclaimed = 0_u32;
        let mut run_start = 0_u32;
        let mut run_len = 0_u32;
        for lbi in 1..self.ctx.meta.num_blocks() {
            let block = LogicalBlockIdx(lbi);
            let orphaned = self.ctx.bitmap.is_allocated(block)
                && !referenced.contains(&lbi)
                && !self.ctx.bitmap.is_reserved(block);
            if orphaned {
                if run_len == 0 {
                    run_start = lbi;
                }
                run_len += 1;
            } else if run_len > 0 {
                self.ctx.bitmap.clear_run(
                    LogicalBlockIdx(run_start),
                    run_len,
                    self.ctx.persist.as_ref(),
                );
                reclaimed += run_len;
                run_len = 0;
            }
        }
        if run_len > 0 {
            self.ctx
                .bitmap
                .clear_run(LogicalBlockIdx(run_start), run_len, self.ctx.persist.as_ref());
            reclaimed += run_len;
        }
        if reclaimed > 0 {
            debug!(target: "ulayfs::file", reclaimed, "orphaned bitmap bits reclaimed");
            self.ctx.persist.fence();
        }
        reclaimed
    }
}

impl std::fmt::Debug for File {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("File")
            .field("size", &self.size())
            .field("capacity_blocks", &self.capacity_blocks())
            .finish_non_exhaustive()
    }
}
