//! Persistence primitives.
//!
//! The core never touches the backing file directly; every durable byte
//! range goes through a [`Persist`] sink. `persist` is the unfenced
//! cache-line writeback, `fence` the store fence. On PMEM hardware these
//! would be `clwb`/`sfence`; the file-backed sink writes through to the
//! image, and the recording sink keeps the ordered event stream so tests
//! can materialize the durable image at any cut point.
//!
//! Persistence failures are not a recoverable error: on functional
//! hardware the primitives cannot fail, so an injected failure aborts.

use parking_lot::Mutex;
use std::fs::File;
use std::os::unix::fs::FileExt;
use tracing::error;
use ulayfs_types::{BLOCK_SIZE, LogicalBlockIdx};

/// Sink for durable byte ranges.
pub trait Persist: Send + Sync {
    /// Flush `bytes` at `offset` within `block`, without a fence.
    fn persist(&self, block: LogicalBlockIdx, offset: usize, bytes: &[u8]);

    /// Order all previously issued flushes before any later ones.
    fn fence(&self);
}

/// Discards everything. Used for volatile in-memory files and unit tests
/// that do not inspect the durable image.
#[derive(Debug, Default)]
pub struct NullPersist;

impl Persist for NullPersist {
    fn persist(&self, _block: LogicalBlockIdx, _offset: usize, _bytes: &[u8]) {}
    fn fence(&self) {}
}

/// Writes through to the backing file image.
#[derive(Debug)]
pub struct FilePersist {
    file: File,
    sync_on_fence: bool,
}

impl FilePersist {
    #[must_use]
    pub fn new(file: File) -> Self {
        Self {
            file,
            sync_on_fence: false,
        }
    }

    /// Make `fence` issue `fdatasync`. Off by default: the emulated fence
    /// only orders stores, it does not promise page-cache durability.
    #[must_use]
    pub fn with_sync_on_fence(mut self, sync: bool) -> Self {
        self.sync_on_fence = sync;
        self
    }
}

impl Persist for FilePersist {
    fn persist(&self, block: LogicalBlockIdx, offset: usize, bytes: &[u8]) {
        debug_assert!(offset + bytes.len() <= BLOCK_SIZE);
        let pos = block.byte_offset() + offset as u64;
        if let Err(err) = self.file.write_all_at(bytes, pos) {
            error!(target: "ulayfs::pmem", block = block.0, offset, "persist failed: {err}");
            panic!("persistence failure writing block {block} at {offset}: {err}");
        }
    }

    fn fence(&self) {
        if self.sync_on_fence {
            if let Err(err) = self.file.sync_data() {
                error!(target: "ulayfs::pmem", "fence sync failed: {err}");
                panic!("persistence failure on fence: {err}");
            }
        }
    }
}

/// One recorded persistence event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistEvent {
    Write {
        block: LogicalBlockIdx,
        offset: usize,
        bytes: Vec<u8>,
    },
    Fence,
}

/// Records the ordered flush/fence stream over a base image.
///
/// `image_at(cut)` replays the first `cut` events onto the base image,
/// which is exactly the durable state of a crash at that point (the
/// emulation applies unfenced flushes in issue order; reordering windows
/// between fences are not explored).
#[derive(Debug)]
pub struct RecordingPersist {
    base: Vec<u8>,
    events: Mutex<Vec<PersistEvent>>,
}

impl RecordingPersist {
    /// Start recording over a zeroed image of `num_blocks` blocks.
    #[must_use]
    pub fn new(num_blocks: u32) -> Self {
        Self {
            base: vec![0; num_blocks as usize * BLOCK_SIZE],
            events: Mutex::new(Vec::new()),
        }
    }

    /// Start recording over an existing image.
    #[must_use]
    pub fn with_base(base: Vec<u8>) -> Self {
        Self {
            base,
            events: Mutex::new(Vec::new()),
        }
    }

    /// Number of events recorded so far.
    #[must_use]
    pub fn event_count(&self) -> usize {
        self.events.lock().len()
    }

    /// Event indices (exclusive cut points) just after each fence.
    #[must_use]
    pub fn fence_cuts(&self) -> Vec<usize> {
        self.events
            .lock()
            .iter()
            .enumerate()
            .filter_map(|(i, e)| matches!(e, PersistEvent::Fence).then_some(i + 1))
            .collect()
    }

    /// Materialize the durable image after the first `cut` events.
    #[must_use]
    pub fn image_at(&self, cut: usize) -> Vec<u8> {
        let mut image = self.base.clone();
        let events = self.events.lock();
        for event in events.iter().take(cut) {
            if let PersistEvent::Write {
                block,
                offset,
                bytes,
            } = event
            {
                let start = block.0 as usize * BLOCK_SIZE + offset;
                image[start..start + bytes.len()].copy_from_slice(bytes);
            }
        }
        image
    }

    /// Materialize the durable image with every event applied.
    #[must_use]
    pub fn image_now(&self) -> Vec<u8> {
        self.image_at(self.event_count())
    }
}

impl Persist for RecordingPersist {
    fn persist(&self, block: LogicalBlockIdx, offset: usize, bytes: &[u8]) {
        debug_assert!(offset + bytes.len() <= BLOCK_SIZE);
        self.events.lock().push(PersistEvent::Write {
            block,
            offset,
            bytes: bytes.to_vec(),
        });
    }

    fn fence(&self) {
        self.events.lock().push(PersistEvent::Fence);
    }
}
