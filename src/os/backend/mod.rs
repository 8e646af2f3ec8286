//! Lock backends: the per-platform advisory locking primitives
//!
//! A backend only knows how to lock, unlock and probe a byte range of an
//! open file, flush it, and grow it. Lock *semantics* (the five-level
//! protocol, shared-memory slots) are built on top, once, in
//! [`crate::os::lock`] and [`crate::os::shm`].
//!
//! Backends differ in how a range maps onto native calls:
//!
//! | backend | native call | granularity |
//! |---|---|---|
//! | [`OfdBackend`] | `fcntl(F_OFD_SETLK)` | byte range, per open file description |
//! | [`FlockBackend`] | `flock(2)` | whole file |
//! | [`WinBackend`] | `LockFileEx` | byte range, per handle |

use std::fmt;
use std::fs::File;
use std::io;
use std::sync::Arc;

#[cfg(unix)]
mod flock;
#[cfg(any(target_os = "linux", target_vendor = "apple"))]
mod ofd;
#[cfg(windows)]
mod windows;

#[cfg(unix)]
pub use flock::FlockBackend;
#[cfg(any(target_os = "linux", target_vendor = "apple"))]
pub use ofd::OfdBackend;
#[cfg(windows)]
pub use windows::WinBackend;

// ============================================================================
// Lock bytes
// ============================================================================

/// Byte offset of the pending lock byte (1 GiB, outside any real page)
pub const PENDING_BYTE: u64 = 0x4000_0000;
/// Byte offset of the reserved lock byte
pub const RESERVED_BYTE: u64 = PENDING_BYTE + 1;
/// First byte of the shared lock range
pub const SHARED_FIRST: u64 = PENDING_BYTE + 2;
/// Number of bytes in the shared lock range
pub const SHARED_SIZE: u64 = 510;

/// A window of bytes to lock. `len == 0` extends to the end of the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockRange {
    pub start: u64,
    pub len: u64,
}

impl LockRange {
    /// The whole file; unlocking it releases every lock on the descriptor
    pub const FILE: LockRange = LockRange { start: 0, len: 0 };
    /// The pending byte
    pub const PENDING: LockRange = LockRange::new(PENDING_BYTE, 1);
    /// The reserved byte
    pub const RESERVED: LockRange = LockRange::new(RESERVED_BYTE, 1);
    /// The shared range
    pub const SHARED: LockRange = LockRange::new(SHARED_FIRST, SHARED_SIZE);

    pub const fn new(start: u64, len: u64) -> Self {
        Self { start, len }
    }

    pub fn is_whole_file(&self) -> bool {
        self.start == 0 && self.len == 0
    }
}

/// How finely a backend can lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    /// Independent locks on arbitrary byte ranges
    ByteRange,
    /// One lock per descriptor covering the whole file
    WholeFile,
}

// ============================================================================
// Backend trait
// ============================================================================

/// Per-platform lock primitives.
///
/// None of these calls block. Lock ownership belongs to the descriptor the
/// call is made on, so two `File`s opened on the same path conflict with each
/// other even inside one process.
pub trait LockBackend: Send + Sync + fmt::Debug {
    /// Which backend this is
    fn kind(&self) -> BackendKind;

    /// Range or whole-file locking
    fn granularity(&self) -> Granularity;

    /// Whether re-locking a held shared range as exclusive (and back)
    /// converts the existing lock in place without ever dropping it
    fn atomic_upgrade(&self) -> bool;

    /// Try to lock `range`. `Ok(true)` acquired, `Ok(false)` a conflicting
    /// lock is held elsewhere, `Err` a hard failure.
    fn lock(&self, file: &File, range: LockRange, exclusive: bool) -> io::Result<bool>;

    /// Release `range`. Releasing a range that is not locked is not an error.
    fn unlock(&self, file: &File, range: LockRange) -> io::Result<()>;

    /// Whether a write lock held through another descriptor overlaps `range`.
    /// Never changes the locks held through `file`.
    fn probe(&self, file: &File, range: LockRange) -> io::Result<bool>;

    /// Flush to stable storage. `full` asks for power-loss durability where
    /// the platform distinguishes it; `data_only` may skip metadata.
    fn sync(&self, file: &File, full: bool, data_only: bool) -> io::Result<()> {
        crate::os::sys::sync(file, full, data_only)
    }

    /// Make the file at least `size` bytes long. Never shrinks.
    fn allocate(&self, file: &File, size: u64) -> io::Result<()> {
        crate::os::sys::allocate(file, size)
    }
}

// ============================================================================
// Backend selection
// ============================================================================

/// The lock backends compiled for this target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// Open-file-description range locks (Linux, Darwin)
    #[cfg(any(target_os = "linux", target_vendor = "apple"))]
    Ofd,
    /// Whole-file `flock(2)` locks
    #[cfg(unix)]
    Flock,
    /// Windows `LockFileEx` range locks
    #[cfg(windows)]
    LockFileEx,
}

impl BackendKind {
    /// Every backend usable on this target, preferred first
    pub fn available() -> Vec<BackendKind> {
        vec![
            #[cfg(any(target_os = "linux", target_vendor = "apple"))]
            BackendKind::Ofd,
            #[cfg(unix)]
            BackendKind::Flock,
            #[cfg(windows)]
            BackendKind::LockFileEx,
        ]
    }

    /// Short name
    pub fn name(self) -> &'static str {
        match self {
            #[cfg(any(target_os = "linux", target_vendor = "apple"))]
            BackendKind::Ofd => "ofd",
            #[cfg(unix)]
            BackendKind::Flock => "flock",
            #[cfg(windows)]
            BackendKind::LockFileEx => "lockfileex",
        }
    }

    /// Instantiate the backend
    pub fn backend(self) -> Arc<dyn LockBackend> {
        match self {
            #[cfg(any(target_os = "linux", target_vendor = "apple"))]
            BackendKind::Ofd => Arc::new(OfdBackend),
            #[cfg(unix)]
            BackendKind::Flock => Arc::new(FlockBackend),
            #[cfg(windows)]
            BackendKind::LockFileEx => Arc::new(WinBackend),
        }
    }
}

impl Default for BackendKind {
    #[cfg(all(any(target_os = "linux", target_vendor = "apple"), not(feature = "flock")))]
    fn default() -> Self {
        BackendKind::Ofd
    }

    #[cfg(all(
        unix,
        any(not(any(target_os = "linux", target_vendor = "apple")), feature = "flock")
    ))]
    fn default() -> Self {
        BackendKind::Flock
    }

    #[cfg(windows)]
    fn default() -> Self {
        BackendKind::LockFileEx
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
