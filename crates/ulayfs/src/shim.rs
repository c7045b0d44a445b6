//! The interception surface.
//!
//! A registry from file descriptors to open files: descriptors whose
//! backing file carries the signature (or was just created through here)
//! are served by the layered core, everything else passes through to
//! plain positional I/O. The real syscall interposition lives outside
//! this crate; it calls these entry points.

use crate::file::{DEFAULT_PREALLOC_BLOCKS, File};
use crate::shm;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::{Arc, Once};
use tracing::{debug, info, warn};
use ulayfs_error::{Result, UlayfsError};
use ulayfs_pmem::FilePersist;
use ulayfs_types::{BLOCK_SIZE, FILE_SIGNATURE};

/// Compile-time options, printed when `ULAYFS_SHOW_CONFIG` is set.
#[derive(Debug, Clone, Copy)]
pub struct BuildOptions {
    pub block_size: usize,
    pub cacheline_size: usize,
    pub inline_tx_entries: u16,
    pub tx_entries_per_block: u16,
}

impl BuildOptions {
    #[must_use]
    pub fn resolved() -> Self {
        Self {
            block_size: BLOCK_SIZE,
            cacheline_size: ulayfs_types::CACHELINE_SIZE,
            inline_tx_entries: ulayfs_types::NUM_INLINE_TX_ENTRY,
            tx_entries_per_block: ulayfs_types::NUM_TX_ENTRY_PER_BLOCK,
        }
    }
}

impl fmt::Display for BuildOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "ulayfs build options:")?;
        writeln!(f, "  block_size           = {}", self.block_size)?;
        writeln!(f, "  cacheline_size       = {}", self.cacheline_size)?;
        writeln!(f, "  inline_tx_entries    = {}", self.inline_tx_entries)?;
        write!(f, "  tx_entries_per_block = {}", self.tx_entries_per_block)
    }
}

/// Runtime layout knobs for newly created files.
#[derive(Debug, Clone, Copy)]
pub struct LayoutOptions {
    /// Blocks preallocated at create; fixes the file's capacity.
    pub prealloc_blocks: u32,
}

impl Default for LayoutOptions {
    fn default() -> Self {
        Self {
            prealloc_blocks: DEFAULT_PREALLOC_BLOCKS,
        }
    }
}

enum Registration {
    Layered {
        file: Arc<File>,
        /// Keeps the descriptor the caller received alive.
        _os: std::fs::File,
    },
    Passthrough(std::fs::File),
}

/// Descriptor registry dispatching intercepted operations.
pub struct Shim {
    layout: LayoutOptions,
    files: RwLock<HashMap<RawFd, Registration>>,
}

impl Default for Shim {
    fn default() -> Self {
        Self::new()
    }
}

impl Shim {
    #[must_use]
    pub fn new() -> Self {
        Self::with_layout(LayoutOptions::default())
    }

    #[must_use]
    pub fn with_layout(layout: LayoutOptions) -> Self {
        maybe_show_config();
        Self {
            layout,
            files: RwLock::new(HashMap::new()),
        }
    }

    /// Open `path`, registering it with the core when the file carries
    /// the signature or was just created empty here. Returns the OS
    /// descriptor.
    pub fn open(&self, path: &Path, create: bool) -> Result<RawFd> {
        let os_file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .truncate(false)
            .open(path)?;
        let fd = os_file.as_raw_fd();
        let len = os_file.metadata()?.len();

        let registration = if len == 0 && create {
            os_file.set_len(u64::from(self.layout.prealloc_blocks) * BLOCK_SIZE as u64)?;
            let file = File::create(
                self.layout.prealloc_blocks,
                Arc::new(FilePersist::new(os_file.try_clone()?)),
            )?;
            self.pin_shm_path(&os_file);
            info!(target: "ulayfs::shim", fd, path = %path.display(), "created and registered");
            Registration::Layered {
                file: Arc::new(file),
                _os: os_file,
            }
        } else if has_signature(&os_file, len) {
            let image = std::fs::read(path)?;
            let file =
                File::open_image(image, Arc::new(FilePersist::new(os_file.try_clone()?)))?;
            self.pin_shm_path(&os_file);
            info!(target: "ulayfs::shim", fd, path = %path.display(), "signature found, registered");
            Registration::Layered {
                file: Arc::new(file),
                _os: os_file,
            }
        } else {
            debug!(target: "ulayfs::shim", fd, path = %path.display(), "no signature, passthrough");
            Registration::Passthrough(os_file)
        };

        self.files.write().insert(fd, registration);
        Ok(fd)
    }

    /// Positional read on a registered descriptor.
    pub fn pread(&self, fd: RawFd, buf: &mut [u8], offset: u64) -> Result<usize> {
        let files = self.files.read();
        match files.get(&fd) {
            Some(Registration::Layered { file, .. }) => {
                let file = Arc::clone(file);
                drop(files);
                file.pread(buf, offset)
            }
            Some(Registration::Passthrough(os)) => Ok(os.read_at(buf, offset)?),
            None => Err(UlayfsError::NotRegistered(fd)),
        }
    }

    /// Positional write on a registered descriptor.
    pub fn pwrite(&self, fd: RawFd, buf: &[u8], offset: u64) -> Result<usize> {
        let files = self.files.read();
        match files.get(&fd) {
            Some(Registration::Layered { file, .. }) => {
                let file = Arc::clone(file);
                drop(files);
                file.pwrite(buf, offset)
            }
            Some(Registration::Passthrough(os)) => Ok(os.write_at(buf, offset)?),
            None => Err(UlayfsError::NotRegistered(fd)),
        }
    }

    /// Drop a registration (the descriptor itself closes with it).
    pub fn close(&self, fd: RawFd) {
        self.files.write().remove(&fd);
    }

    /// The layered file behind `fd`, if it is registered with the core.
    #[must_use]
    pub fn layered(&self, fd: RawFd) -> Option<Arc<File>> {
        match self.files.read().get(&fd) {
            Some(Registration::Layered { file, .. }) => Some(Arc::clone(file)),
            _ => None,
        }
    }

    /// Pin the companion shared-memory path; host filesystems without
    /// user xattr support just lose cross-process bookkeeping.
    fn pin_shm_path(&self, os_file: &std::fs::File) {
        if let Err(err) = shm::init_shm_path(os_file) {
            warn!(target: "ulayfs::shim", "shm path xattr unavailable: {err}");
        }
    }
}

fn has_signature(file: &std::fs::File, len: u64) -> bool {
    if len < BLOCK_SIZE as u64 {
        return false;
    }
    let mut signature = [0_u8; 16];
    match file.read_exact_at(&mut signature, 0) {
        Ok(()) => &signature == FILE_SIGNATURE,
        Err(_) => false,
    }
}

static SHOW_CONFIG: Once = Once::new();

/// Honor `ULAYFS_SHOW_CONFIG` once per process.
fn maybe_show_config() {
    SHOW_CONFIG.call_once(|| {
        if std::env::var_os("ULAYFS_SHOW_CONFIG").is_some() {
            println!("{}", BuildOptions::resolved());
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn created_file_registers_and_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("layered");
        let shim = Shim::with_layout(LayoutOptions {
            prealloc_blocks: 256,
        });

        let fd = shim.open(&path, true).expect("open");
        assert!(shim.layered(fd).is_some());

        let written = shim.pwrite(fd, b"hello shim", 10).expect("pwrite");
        assert_eq!(written, 10);
        let mut out = [0_u8; 10];
        assert_eq!(shim.pread(fd, &mut out, 10).expect("pread"), 10);
        assert_eq!(&out, b"hello shim");
        shim.close(fd);
    }

    #[test]
    fn reopen_recognizes_signature() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("layered");
        let shim = Shim::with_layout(LayoutOptions {
            prealloc_blocks: 256,
        });

        let fd = shim.open(&path, true).expect("create");
        shim.pwrite(fd, b"persistent", 0).expect("pwrite");
        shim.close(fd);

        let fd = shim.open(&path, false).expect("reopen");
        assert!(shim.layered(fd).is_some());
        let mut out = [0_u8; 10];
        assert_eq!(shim.pread(fd, &mut out, 0).expect("pread"), 10);
        assert_eq!(&out, b"persistent");
        shim.close(fd);
    }

    #[test]
    fn foreign_file_passes_through() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("plain");
        std::fs::write(&path, b"plain bytes").expect("write");

        let shim = Shim::new();
        let fd = shim.open(&path, false).expect("open");
        assert!(shim.layered(fd).is_none());

        let mut out = [0_u8; 5];
        assert_eq!(shim.pread(fd, &mut out, 6).expect("pread"), 5);
        assert_eq!(&out, b"bytes");

        shim.pwrite(fd, b"PLAIN", 0).expect("pwrite");
        assert_eq!(std::fs::read(&path).expect("read"), b"PLAIN bytes");
        shim.close(fd);
    }

    #[test]
    fn unknown_descriptor_is_rejected() {
        let shim = Shim::new();
        let mut buf = [0_u8; 1];
        assert!(matches!(
            shim.pread(9999, &mut buf, 0),
            Err(UlayfsError::NotRegistered(9999))
        ));
    }
}
