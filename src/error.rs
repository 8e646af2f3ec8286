//! Error types and Result aliases for the host VFS
//!
//! Every failure is reported in the engine's own vocabulary: a primary
//! [`ErrorCode`] plus an extended code using the engine's numbering. No
//! free-form text originates here; `Display` prints the engine's canonical
//! string for the primary code.

use std::fmt;
use std::io;

// ============================================================================
// Primary codes
// ============================================================================

/// Primary result codes understood by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    /// Generic error
    Error = 1,
    /// Internal logic error
    Internal = 2,
    /// Access permission denied
    Perm = 3,
    /// Callback requested an abort
    Abort = 4,
    /// The database file is locked
    Busy = 5,
    /// A table in the database is locked
    Locked = 6,
    /// Out of memory
    NoMem = 7,
    /// Attempt to write a readonly database
    ReadOnly = 8,
    /// Operation interrupted
    Interrupt = 9,
    /// Disk I/O error
    IoErr = 10,
    /// The database disk image is malformed
    Corrupt = 11,
    /// Unknown opcode or file control
    NotFound = 12,
    /// Insertion failed because the disk is full
    Full = 13,
    /// Unable to open the database file
    CantOpen = 14,
    /// Locking protocol error
    Protocol = 15,
    /// Library used incorrectly
    Misuse = 21,
    /// Large file support is disabled
    NoLfs = 22,
}

impl ErrorCode {
    /// Canonical engine string for this code (`sqlite3_errstr`)
    pub fn errstr(self) -> &'static str {
        match self {
            ErrorCode::Error => "SQL logic error",
            ErrorCode::Internal => "internal error",
            ErrorCode::Perm => "access permission denied",
            ErrorCode::Abort => "query aborted",
            ErrorCode::Busy => "database is locked",
            ErrorCode::Locked => "database table is locked",
            ErrorCode::NoMem => "out of memory",
            ErrorCode::ReadOnly => "attempt to write a readonly database",
            ErrorCode::Interrupt => "interrupted",
            ErrorCode::IoErr => "disk I/O error",
            ErrorCode::Corrupt => "database disk image is malformed",
            ErrorCode::NotFound => "unknown operation",
            ErrorCode::Full => "database or disk is full",
            ErrorCode::CantOpen => "unable to open database file",
            ErrorCode::Protocol => "locking protocol",
            ErrorCode::Misuse => "bad parameter or other API misuse",
            ErrorCode::NoLfs => "large file support is disabled",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.errstr())
    }
}

// ============================================================================
// Extended codes
// ============================================================================

/// Extended I/O error kinds (`SQLITE_IOERR_*`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum IoErrKind {
    Read = 1,
    ShortRead = 2,
    Write = 3,
    Fsync = 4,
    DirFsync = 5,
    Truncate = 6,
    Fstat = 7,
    Unlock = 8,
    RdLock = 9,
    Delete = 10,
    NoMem = 12,
    Access = 13,
    CheckReservedLock = 14,
    Lock = 15,
    Close = 16,
    ShmOpen = 18,
    ShmSize = 19,
    ShmLock = 20,
    ShmMap = 21,
    Seek = 22,
    DeleteNoEnt = 23,
}

/// `SQLITE_BUSY_TIMEOUT`
pub const BUSY_TIMEOUT: i32 = ErrorCode::Busy as i32 | (3 << 8);
/// `SQLITE_READONLY_CANTINIT`
pub const READONLY_CANTINIT: i32 = ErrorCode::ReadOnly as i32 | (5 << 8);
/// `SQLITE_CANTOPEN_ISDIR`
pub const CANTOPEN_ISDIR: i32 = ErrorCode::CantOpen as i32 | (2 << 8);

// ============================================================================
// Error
// ============================================================================

/// An engine-facing error: a primary code and its extended refinement
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("{}", .code.errstr())]
pub struct Error {
    /// Primary code
    pub code: ErrorCode,
    /// Extended code; equals the primary code when there is no refinement
    pub extended: i32,
}

impl Error {
    /// Create an error with no extended refinement
    pub fn new(code: ErrorCode) -> Self {
        Self {
            code,
            extended: code as i32,
        }
    }

    /// Create an error with an explicit extended code
    pub fn with_extended(code: ErrorCode, extended: i32) -> Self {
        debug_assert_eq!(extended & 0xff, code as i32);
        Self { code, extended }
    }

    /// `SQLITE_IOERR_*`
    pub fn io(kind: IoErrKind) -> Self {
        Self {
            code: ErrorCode::IoErr,
            extended: ErrorCode::IoErr as i32 | ((kind as i32) << 8),
        }
    }

    /// Contention outlasted a non-zero wait budget
    pub fn busy_timeout() -> Self {
        Self::with_extended(ErrorCode::Busy, BUSY_TIMEOUT)
    }

    /// The extended result code (`sqlite3_extended_errcode`)
    pub fn extended_code(&self) -> i32 {
        self.extended
    }

    /// The I/O kind, for `IoErr` codes carrying one
    pub fn io_kind(&self) -> Option<IoErrKind> {
        if self.code != ErrorCode::IoErr {
            return None;
        }
        let kind = match self.extended >> 8 {
            1 => IoErrKind::Read,
            2 => IoErrKind::ShortRead,
            3 => IoErrKind::Write,
            4 => IoErrKind::Fsync,
            5 => IoErrKind::DirFsync,
            6 => IoErrKind::Truncate,
            7 => IoErrKind::Fstat,
            8 => IoErrKind::Unlock,
            9 => IoErrKind::RdLock,
            10 => IoErrKind::Delete,
            12 => IoErrKind::NoMem,
            13 => IoErrKind::Access,
            14 => IoErrKind::CheckReservedLock,
            15 => IoErrKind::Lock,
            16 => IoErrKind::Close,
            18 => IoErrKind::ShmOpen,
            19 => IoErrKind::ShmSize,
            20 => IoErrKind::ShmLock,
            21 => IoErrKind::ShmMap,
            22 => IoErrKind::Seek,
            23 => IoErrKind::DeleteNoEnt,
            _ => return None,
        };
        Some(kind)
    }

    /// Map a host failure onto the engine vocabulary.
    ///
    /// Specific conditions (disk full, out of memory, permission, read-only
    /// media) win over the generic `IoErr` carrying `kind`.
    pub fn from_io(err: &io::Error, kind: IoErrKind) -> Self {
        match crate::os::sys::classify(err) {
            Some(HostFailure::Full) => Self::new(ErrorCode::Full),
            Some(HostFailure::NoMem) => Self::new(ErrorCode::NoMem),
            Some(HostFailure::Perm) => Self::new(ErrorCode::Perm),
            Some(HostFailure::ReadOnly) => Self::new(ErrorCode::ReadOnly),
            Some(HostFailure::Contention) | None => Self::io(kind),
        }
    }

    /// Map a failure of a lock primitive; contention becomes `Busy`.
    pub fn from_lock_io(err: &io::Error, kind: IoErrKind) -> Self {
        match crate::os::sys::classify(err) {
            Some(HostFailure::Contention) => Self::new(ErrorCode::Busy),
            Some(HostFailure::Perm) if crate::os::sys::is_lock_conflict(err) => {
                Self::new(ErrorCode::Busy)
            }
            Some(HostFailure::Perm) => Self::new(ErrorCode::Perm),
            Some(HostFailure::NoMem) => Self::new(ErrorCode::NoMem),
            _ => Self::io(kind),
        }
    }
}

impl From<ErrorCode> for Error {
    fn from(code: ErrorCode) -> Self {
        Self::new(code)
    }
}

/// Host failure classes that have a more specific engine code than `IoErr`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HostFailure {
    Full,
    NoMem,
    Perm,
    ReadOnly,
    Contention,
}

/// Result type alias for VFS operations
pub type Result<T> = std::result::Result<T, Error>;
