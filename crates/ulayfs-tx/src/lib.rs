#![forbid(unsafe_code)]
//! Transaction log and copy-on-write write path.
//!
//! Three collaborators over the shared [`ulayfs_pmem::FsContext`]:
//!
//! - [`TxMgr`] — traversal, commit, and extension of the lock-free tx
//!   log chain.
//! - [`LogMgr`] — variable-length log entries packed into the per-thread
//!   log-entry region.
//! - [`cow::do_pwrite`] — the optimistic write protocol tying the
//!   allocator, log manager, and tx manager together.

pub mod cow;
pub mod log;
pub mod tx;

pub use cow::{BlockView, WriteCtx, do_pwrite};
pub use log::{LogCoverage, LogMgr};
pub use tx::{TxCursor, TxMgr};
