//! The block table: projection of the committed tx log onto virtual
//! block indices.
//!
//! Applies commit entries in log order to a `vidx → lidx` vector, last
//! writer wins. The table is a process-local acceleration — the log is
//! always authoritative — so updates just replay whatever installed
//! entries the cursor has not seen yet. Blocks replaced by newer commits
//! can be folded back into the updating thread's free lists.

use parking_lot::RwLock;
use ulayfs_alloc::Allocator;
use ulayfs_error::Result;
use ulayfs_pmem::TxEntryKind;
use ulayfs_tx::{BlockView, LogMgr, TxCursor, TxMgr};
use ulayfs_types::{LogicalBlockIdx, VirtualBlockIdx};

#[derive(Debug)]
struct TableState {
    table: Vec<LogicalBlockIdx>,
    cursor: TxCursor,
}

/// Projection state for one open file.
#[derive(Debug)]
pub struct BlkTable {
    tx_mgr: TxMgr,
    log_mgr: LogMgr,
    state: RwLock<TableState>,
}

impl BlkTable {
    #[must_use]
    pub fn new(tx_mgr: TxMgr, log_mgr: LogMgr) -> Self {
        Self {
            tx_mgr,
            log_mgr,
            state: RwLock::new(TableState {
                table: Vec::new(),
                cursor: TxCursor::start(),
            }),
        }
    }

    /// Apply installed entries up to the current tail. Old blocks
    /// replaced by the applied entries are folded into `recycle`'s free
    /// lists when one is supplied.
    pub fn update_with(&self, mut recycle: Option<&mut Allocator>) -> Result<TxCursor> {
        let mut state = self.state.write();
        loop {
            if state.cursor.is_overflow() && !self.tx_mgr.handle_overflow(&mut state.cursor, None)?
            {
                break;
            }
            let entry = self.tx_mgr.entry_at(&state.cursor);
            if entry.is_empty() {
                break;
            }
            self.apply(&mut state, entry, recycle.as_deref_mut())?;
            if !self.tx_mgr.advance(&mut state.cursor, None)? {
                break;
            }
        }
        Ok(state.cursor.clone())
    }

    /// Projected logical block for `vidx`, null for holes.
    #[must_use]
    pub fn lookup(&self, vidx: VirtualBlockIdx) -> LogicalBlockIdx {
        let state = self.state.read();
        state
            .table
            .get(vidx.0 as usize)
            .copied()
            .unwrap_or(LogicalBlockIdx::META)
    }

    /// Projected blocks for the range `[vb, vb + n)` under one lock
    /// acquisition.
    #[must_use]
    pub fn lookup_range(&self, vb: VirtualBlockIdx, n: u32) -> Vec<LogicalBlockIdx> {
        let state = self.state.read();
        (0..n)
            .map(|i| {
                state
                    .table
                    .get((vb.0 + i) as usize)
                    .copied()
                    .unwrap_or(LogicalBlockIdx::META)
            })
            .collect()
    }

    fn apply(
        &self,
        state: &mut TableState,
        entry: ulayfs_pmem::TxEntry,
        recycle: Option<&mut Allocator>,
    ) -> Result<()> {
        let mapping: Vec<(VirtualBlockIdx, LogicalBlockIdx)> = match entry.kind() {
            TxEntryKind::InlineCommit {
                vidx,
                num_blocks,
                lidx,
            } => (0..num_blocks)
                .map(|i| (VirtualBlockIdx(vidx.0 + i), LogicalBlockIdx(lidx.0 + i)))
                .collect(),
            TxEntryKind::IndirectCommit { log_idx, .. } => {
                let coverage = self.log_mgr.read_coverage(log_idx)?;
                (0..coverage.num_blocks)
                    .map(|i| {
                        let vidx = VirtualBlockIdx(coverage.begin_vidx.0 + i);
                        let lidx = coverage
                            .lookup(vidx)
                            .expect("coverage spans its own range");
                        (vidx, lidx)
                    })
                    .collect()
            }
            TxEntryKind::Begin | TxEntryKind::Empty => return Ok(()),
        };

        let mut replaced = Vec::with_capacity(mapping.len());
        for (vidx, lidx) in mapping {
            let slot = vidx.0 as usize;
            if slot >= state.table.len() {
                state.table.resize(slot + 1, LogicalBlockIdx::META);
            }
            replaced.push(state.table[slot]);
            state.table[slot] = lidx;
        }
        if let Some(allocator) = recycle {
            allocator.free_image(&replaced);
        }
        Ok(())
    }
}

impl BlockView for BlkTable {
    fn update(&self) -> Result<TxCursor> {
        self.update_with(None)
    }

    fn get(&self, vidx: VirtualBlockIdx) -> LogicalBlockIdx {
        self.lookup(vidx)
    }
}
