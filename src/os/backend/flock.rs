//! Whole-file `flock(2)` locks
//!
//! Every range collapses onto the one lock a descriptor may hold. Shared
//! requests become `LOCK_SH` and exclusive ones `LOCK_EX`; only
//! [`LockRange::FILE`] actually releases anything.
//!
//! Converting a held `LOCK_SH` to `LOCK_EX` is not atomic: on failure the
//! kernel may already have dropped the shared lock, so callers re-assert it.

use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;

use super::{BackendKind, Granularity, LockBackend, LockRange};

/// Whole-file locks through `flock(2)`
#[derive(Debug, Default, Clone, Copy)]
pub struct FlockBackend;

fn flock(file: &File, op: libc::c_int) -> io::Result<bool> {
    loop {
        let rc = unsafe { libc::flock(file.as_raw_fd(), op) };
        if rc == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) => continue,
            Some(errno) if errno == libc::EWOULDBLOCK => return Ok(false),
            _ => return Err(err),
        }
    }
}

impl LockBackend for FlockBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Flock
    }

    fn granularity(&self) -> Granularity {
        Granularity::WholeFile
    }

    fn atomic_upgrade(&self) -> bool {
        false
    }

    fn lock(&self, file: &File, _range: LockRange, exclusive: bool) -> io::Result<bool> {
        let op = if exclusive { libc::LOCK_EX } else { libc::LOCK_SH };
        flock(file, op | libc::LOCK_NB)
    }

    fn unlock(&self, file: &File, range: LockRange) -> io::Result<()> {
        if range.is_whole_file() {
            flock(file, libc::LOCK_UN)?;
        }
        Ok(())
    }

    /// Only meaningful while `file` holds no lock of its own
    fn probe(&self, file: &File, _range: LockRange) -> io::Result<bool> {
        if !flock(file, libc::LOCK_SH | libc::LOCK_NB)? {
            return Ok(true);
        }
        flock(file, libc::LOCK_UN)?;
        Ok(false)
    }
}
