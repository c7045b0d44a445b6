#![forbid(unsafe_code)]
//! uLayFS: a user-space file system core layered over a
//! persistent-memory file.
//!
//! Intercepted open/pread/pwrite calls are served from an internal layout
//! of 4 KiB blocks: a per-thread allocator over persistent bitmaps, a
//! lock-free transaction log defining the serialization order of all
//! mutations, and an optimistic copy-on-write write path that keeps every
//! write crash-consistent and atomic under concurrency.
//!
//! This crate wires the subsystem crates together per open file and
//! carries the collaborators around the core: the block-table projection,
//! the descriptor registry, and the shared-memory path bookkeeping.

pub mod blk_table;
pub mod file;
pub mod shim;
pub mod shm;

pub use blk_table::BlkTable;
pub use file::{DEFAULT_PREALLOC_BLOCKS, File};
pub use shim::{BuildOptions, LayoutOptions, Shim};
pub use shm::{SHM_XATTR_NAME, derive_shm_path, init_shm_path};
pub use ulayfs_error::{Result, UlayfsError};
pub use ulayfs_types::{BLOCK_SIZE, LogicalBlockIdx, VirtualBlockIdx};
