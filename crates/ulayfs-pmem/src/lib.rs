#![forbid(unsafe_code)]
//! Persistent block structures for uLayFS.
//!
//! Everything durable lives here: the 8-byte atomic tx entry word, the
//! allocation bitmaps, the meta block, tx log blocks, byte blocks, the log
//! entry fragment codec, and the persistence sink the rest of the
//! workspace flushes through. The allocator and tx manager crates build on
//! these types; the facade crate wires them together per open file.

pub mod bitmap;
pub mod byte_block;
pub mod entry;
pub mod log_entry;
pub mod mem_table;
pub mod meta;
pub mod persist;
pub mod tx_block;

pub use bitmap::{BitmapSet, BitmapWord};
pub use byte_block::ByteBlock;
pub use entry::{TxEntry, TxEntryKind};
pub use log_entry::{LogEntryFragment, read_fragment, write_fragment};
pub use mem_table::MemTable;
pub use meta::MetaBlock;
pub use persist::{FilePersist, NullPersist, Persist, PersistEvent, RecordingPersist};
pub use tx_block::TxBlock;

use std::sync::Arc;

/// Shared subsystems of one open file, cloned freely across the
/// allocator, the tx manager, and the write path.
#[derive(Clone)]
pub struct FsContext {
    pub meta: Arc<MetaBlock>,
    pub mem: Arc<MemTable>,
    pub bitmap: Arc<BitmapSet>,
    pub persist: Arc<dyn Persist>,
}

impl std::fmt::Debug for FsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsContext")
            .field("num_blocks", &self.meta.num_blocks())
            .finish_non_exhaustive()
    }
}
