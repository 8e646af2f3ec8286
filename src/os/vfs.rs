//! Virtual File System traits and types
//!
//! This module defines the contract the engine calls through: open flags,
//! lock levels, file controls, and the `Vfs`/`VfsFile` traits. The host
//! implementation lives in [`crate::os::host`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use bitflags::bitflags;

use crate::error::{Error, ErrorCode, IoErrKind, Result};
use crate::os::shm::ShmSegment;

// ============================================================================
// Flags and Enums
// ============================================================================

bitflags! {
    /// Flags for opening files
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpenFlags: u32 {
        const READONLY         = 0x00000001;
        const READWRITE        = 0x00000002;
        const CREATE           = 0x00000004;
        const DELETEONCLOSE    = 0x00000008;
        const EXCLUSIVE        = 0x00000010;
        const URI              = 0x00000040;
        const MEMORY           = 0x00000080;
        const MAIN_DB          = 0x00000100;
        const TEMP_DB          = 0x00000200;
        const TRANSIENT_DB     = 0x00000400;
        const MAIN_JOURNAL     = 0x00000800;
        const TEMP_JOURNAL     = 0x00001000;
        const SUBJOURNAL       = 0x00002000;
        const SUPER_JOURNAL    = 0x00004000;
        const WAL              = 0x00080000;
        const NOFOLLOW         = 0x01000000;
    }
}

bitflags! {
    /// Flags for checking file access
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AccessFlags: u32 {
        /// Check if file exists
        const EXISTS = 0;
        /// Check if file is readable and writable
        const READWRITE = 1;
        /// Check if file is readable
        const READ = 2;
    }
}

bitflags! {
    /// Flags for file sync operations
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SyncFlags: u32 {
        const NORMAL   = 0x00002;
        const FULL     = 0x00003;
        const DATAONLY = 0x00010;
    }
}

impl SyncFlags {
    /// FULL shares the NORMAL bit, so compare the low bits exactly
    pub fn is_full(self) -> bool {
        self.bits() & 0x0f == Self::FULL.bits()
    }
}

bitflags! {
    /// Device characteristics flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DeviceCharacteristics: u32 {
        const ATOMIC                  = 0x00000001;
        const SAFE_APPEND             = 0x00000200;
        const SEQUENTIAL              = 0x00000400;
        const UNDELETABLE_WHEN_OPEN   = 0x00000800;
        const POWERSAFE_OVERWRITE     = 0x00001000;
        const IMMUTABLE               = 0x00002000;
    }
}

bitflags! {
    /// Flags for shared memory lock operations
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ShmLockFlags: u32 {
        const UNLOCK    = 1;
        const LOCK      = 2;
        const SHARED    = 4;
        const EXCLUSIVE = 8;
    }
}

impl ShmLockFlags {
    /// The four combinations the engine may pass
    pub fn is_valid(self) -> bool {
        self == Self::LOCK | Self::SHARED
            || self == Self::LOCK | Self::EXCLUSIVE
            || self == Self::UNLOCK | Self::SHARED
            || self == Self::UNLOCK | Self::EXCLUSIVE
    }
}

/// File lock levels (the engine's five-state locking protocol)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(i32)]
pub enum LockType {
    /// No lock held
    #[default]
    None = 0,
    /// Shared lock (multiple readers)
    Shared = 1,
    /// Reserved lock (intend to write)
    Reserved = 2,
    /// Pending lock (waiting for exclusive)
    Pending = 3,
    /// Exclusive lock (single writer)
    Exclusive = 4,
}

/// File control operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileControlOp {
    /// Get current lock state
    LockState,
    /// Hint about expected file size
    SizeHint(u64),
    /// Set the wait budget for lock acquisition on this handle
    LockTimeout(Duration),
    /// Check if the file has been renamed or deleted since it was opened
    HasMoved,
}

/// Result of a file control operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileControlReply {
    /// The operation produced no value
    Done,
    /// Reply to [`FileControlOp::LockState`]
    LockState(LockType),
    /// Reply to [`FileControlOp::LockTimeout`]: the previous budget
    LockTimeout(Duration),
    /// Reply to [`FileControlOp::HasMoved`]
    HasMoved(bool),
}

// ============================================================================
// VFS File Trait
// ============================================================================

/// File handle abstraction
///
/// Lock and shared-memory calls take `&mut self`: transitions on one handle
/// are strictly ordered by its owner.
pub trait VfsFile: Send + Sync {
    /// Read from file at the given offset. A short read zero-fills the rest
    /// of `buf` and returns the number of bytes actually read.
    fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize>;

    /// Write all of `buf` at the given offset
    fn write(&self, buf: &[u8], offset: u64) -> Result<()>;

    /// Truncate file to the given size
    fn truncate(&self, size: u64) -> Result<()>;

    /// Sync file to disk
    fn sync(&self, flags: SyncFlags) -> Result<()>;

    /// Get file size
    fn file_size(&self) -> Result<u64>;

    /// Acquire a file lock
    fn lock(&mut self, lock_type: LockType) -> Result<()>;

    /// Release a file lock down to `lock_type` (SHARED or NONE)
    fn unlock(&mut self, lock_type: LockType) -> Result<()>;

    /// Check if a reserved lock is held by another connection
    fn check_reserved_lock(&self) -> Result<bool>;

    /// File control operations
    fn file_control(&mut self, op: FileControlOp) -> Result<FileControlReply>;

    /// Get sector size for this file
    fn sector_size(&self) -> u32 {
        4096
    }

    /// Get device characteristics
    fn device_characteristics(&self) -> DeviceCharacteristics {
        DeviceCharacteristics::empty()
    }

    /// Map shared memory region (for WAL). `Ok(None)` when the region does
    /// not exist yet and `extend` is false.
    fn shm_map(&mut self, _region: u32, _size: usize, _extend: bool) -> Result<Option<ShmSegment>> {
        Err(Error::io(IoErrKind::ShmMap))
    }

    /// Lock shared memory slots
    fn shm_lock(&mut self, _offset: u32, _n: u32, _flags: ShmLockFlags) -> Result<()> {
        Err(Error::io(IoErrKind::ShmLock))
    }

    /// Shared memory barrier
    fn shm_barrier(&self) {}

    /// Unmap shared memory
    fn shm_unmap(&mut self, _delete: bool) -> Result<()> {
        Ok(())
    }

    /// Release locks and shared memory; the handle must not be used again
    fn close(&mut self) -> Result<()>;
}

// ============================================================================
// VFS Trait
// ============================================================================

/// Virtual File System - platform abstraction
pub trait Vfs: Send + Sync {
    /// VFS name
    fn name(&self) -> &str;

    /// Maximum pathname length supported
    fn max_pathname(&self) -> usize {
        1024
    }

    /// Open a file. `None` opens a uniquely named temporary file that is
    /// deleted on close. Returns the handle and the flags actually in effect.
    fn open(&self, path: Option<&Path>, flags: OpenFlags) -> Result<(Box<dyn VfsFile>, OpenFlags)>;

    /// Delete a file
    fn delete(&self, path: &Path, sync_dir: bool) -> Result<()>;

    /// Check if file exists/is accessible
    fn access(&self, path: &Path, flags: AccessFlags) -> Result<bool>;

    /// Get full pathname from relative path
    fn full_pathname(&self, path: &Path) -> Result<PathBuf>;
}

/// Reject lock requests outside the protocol graph before touching the OS
pub(crate) fn misuse() -> Error {
    Error::new(ErrorCode::Misuse)
}

// ============================================================================
// Tests
// ============================================================================
