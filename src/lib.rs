//! hostvfs - host file, lock and WAL shared-memory layer for a sandboxed SQLite

pub mod config;
pub mod error;
pub mod os;

// Re-export main public types
pub use config::VfsConfig;
pub use error::{Error, ErrorCode, IoErrKind, Result};

// Re-export the VFS surface
pub use os::backend::{BackendKind, LockBackend, LockRange};
pub use os::host::{HostFile, HostVfs};
pub use os::shm::{ShmHandle, ShmRegistry, ShmSegment, SUPPORTS_SHARED_MEMORY};
pub use os::vfs::{
    AccessFlags, FileControlOp, FileControlReply, LockType, OpenFlags, ShmLockFlags, SyncFlags,
    Vfs, VfsFile,
};
