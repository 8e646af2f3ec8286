//! The five-level file lock protocol
//!
//! ```text
//! NONE -> SHARED -> RESERVED -> PENDING -> EXCLUSIVE
//!            ^                                 |
//!            +------------- unlock ------------+
//! ```
//!
//! [`FileLock`] drives one [`LockBackend`] through the protocol on behalf of
//! one file handle. Each level maps onto the lock bytes at 1 GiB:
//!
//! | level | holds |
//! |---|---|
//! | SHARED | shared lock on the shared range |
//! | RESERVED | + exclusive lock on the reserved byte |
//! | PENDING | + exclusive lock on the pending byte (new readers back off) |
//! | EXCLUSIVE | exclusive lock on the shared range; markers released |
//!
//! Whole-file backends collapse all of these onto one lock per descriptor.

use std::fs::File;
use std::io;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{Error, ErrorCode, IoErrKind, Result};
use crate::os::backend::{Granularity, LockBackend, LockRange};
use crate::os::vfs::{misuse, LockType};

// ============================================================================
// Retry loop
// ============================================================================

/// Call `attempt` until it acquires or `timeout` runs out.
///
/// Returns `Ok(false)` on expiry. The deadline is fixed at entry, and the last
/// sleep is trimmed so the loop never overshoots it by more than one attempt.
pub(crate) fn retry<F>(timeout: Duration, interval: Duration, mut attempt: F) -> io::Result<bool>
where
    F: FnMut() -> io::Result<bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if attempt()? {
            return Ok(true);
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(false);
        }
        thread::sleep(interval.min(deadline - now));
    }
}

/// The error for a lock that stayed contended for the whole budget
pub(crate) fn busy(timeout: Duration) -> Error {
    if timeout.is_zero() {
        Error::new(ErrorCode::Busy)
    } else {
        Error::busy_timeout()
    }
}

// ============================================================================
// FileLock
// ============================================================================

/// Lock state for one file handle
#[derive(Debug)]
pub struct FileLock {
    backend: Arc<dyn LockBackend>,
    state: LockType,
    read_only: bool,
    retry_interval: Duration,
}

impl FileLock {
    pub fn new(backend: Arc<dyn LockBackend>, read_only: bool, retry_interval: Duration) -> Self {
        Self {
            backend,
            state: LockType::None,
            read_only,
            retry_interval,
        }
    }

    /// Current level
    pub fn state(&self) -> LockType {
        self.state
    }

    fn byte_range(&self) -> bool {
        self.backend.granularity() == Granularity::ByteRange
    }

    /// Raise the lock to `level`, waiting up to `timeout` for SHARED,
    /// RESERVED and EXCLUSIVE. Requests at or below the current level succeed
    /// without touching the OS.
    pub fn lock(&mut self, file: &File, level: LockType, timeout: Duration) -> Result<()> {
        let current = self.state;
        if level <= current {
            return Ok(());
        }
        let legal = match level {
            LockType::None => false,
            LockType::Shared => current == LockType::None,
            LockType::Reserved => current == LockType::Shared,
            LockType::Pending => current == LockType::Reserved,
            LockType::Exclusive => current >= LockType::Reserved,
        };
        if !legal {
            return Err(misuse());
        }
        if self.read_only && level >= LockType::Reserved {
            return Err(Error::io(IoErrKind::Lock));
        }

        match level {
            LockType::Shared => self.acquire_shared(file, timeout)?,
            LockType::Reserved => self.acquire_reserved(file, timeout)?,
            LockType::Pending => self.acquire_pending(file)?,
            LockType::Exclusive => {
                if self.state < LockType::Pending {
                    self.acquire_pending(file)?;
                    self.state = LockType::Pending;
                }
                self.acquire_exclusive(file, timeout)?;
            }
            LockType::None => return Err(misuse()),
        }

        tracing::trace!(from = ?current, to = ?level, "file lock raised");
        self.state = level;
        Ok(())
    }

    fn acquire_shared(&self, file: &File, timeout: Duration) -> Result<()> {
        let backend = &*self.backend;
        let check_pending = self.byte_range();
        let acquired = retry(timeout, self.retry_interval, || {
            // A writer waiting for EXCLUSIVE holds PENDING: back off
            if check_pending && backend.probe(file, LockRange::PENDING)? {
                return Ok(false);
            }
            backend.lock(file, LockRange::SHARED, false)
        })
        .map_err(|e| Error::from_lock_io(&e, IoErrKind::Lock))?;
        if acquired {
            Ok(())
        } else {
            Err(busy(timeout))
        }
    }

    fn acquire_reserved(&mut self, file: &File, timeout: Duration) -> Result<()> {
        let backend = &*self.backend;
        let acquired = retry(timeout, self.retry_interval, || {
            backend.lock(file, LockRange::RESERVED, true)
        })
        .map_err(|e| Error::from_lock_io(&e, IoErrKind::Lock))?;
        if acquired {
            return Ok(());
        }
        if !self.byte_range() {
            self.reassert_shared(file)?;
        }
        Err(busy(timeout))
    }

    fn acquire_pending(&mut self, file: &File) -> Result<()> {
        let acquired = self
            .backend
            .lock(file, LockRange::PENDING, true)
            .map_err(|e| Error::from_lock_io(&e, IoErrKind::Lock))?;
        if acquired {
            return Ok(());
        }
        if !self.byte_range() {
            self.reassert_shared(file)?;
        }
        Err(Error::new(ErrorCode::Busy))
    }

    fn acquire_exclusive(&mut self, file: &File, timeout: Duration) -> Result<()> {
        let backend = Arc::clone(&self.backend);
        let byte_range = self.byte_range();

        // Range locks that cannot convert in place must drop the shared lock
        // first; PENDING keeps new readers out meanwhile.
        if byte_range && !backend.atomic_upgrade() {
            backend
                .unlock(file, LockRange::SHARED)
                .map_err(|e| Error::from_lock_io(&e, IoErrKind::Lock))?;
        }

        let acquired = retry(timeout, self.retry_interval, || {
            backend.lock(file, LockRange::SHARED, true)
        });
        let acquired = match acquired {
            Ok(acquired) => acquired,
            Err(e) => {
                if !backend.atomic_upgrade() {
                    self.reassert_shared(file)?;
                }
                return Err(Error::from_lock_io(&e, IoErrKind::Lock));
            }
        };
        if !acquired {
            if !backend.atomic_upgrade() {
                self.reassert_shared(file)?;
            }
            return Err(busy(timeout));
        }

        if byte_range {
            backend
                .unlock(file, LockRange::RESERVED)
                .and_then(|()| backend.unlock(file, LockRange::PENDING))
                .map_err(|e| Error::from_io(&e, IoErrKind::Unlock))?;
        }
        Ok(())
    }

    /// Take the shared lock back after a failed exclusive attempt released it.
    /// Losing it here drops the handle to NONE.
    fn reassert_shared(&mut self, file: &File) -> Result<()> {
        match self.backend.lock(file, LockRange::SHARED, false) {
            Ok(true) => Ok(()),
            Ok(false) | Err(_) => {
                tracing::debug!(state = ?self.state, "shared lock lost after failed upgrade");
                self.state = LockType::None;
                Err(Error::io(IoErrKind::RdLock))
            }
        }
    }

    /// Lower the lock to SHARED or NONE
    pub fn unlock(&mut self, file: &File, level: LockType) -> Result<()> {
        if level != LockType::Shared && level != LockType::None {
            return Err(misuse());
        }
        let current = self.state;
        if level >= current {
            return Ok(());
        }
        self.state = level;
        tracing::trace!(from = ?current, to = ?level, "file lock lowered");

        let backend = &*self.backend;
        if level == LockType::Shared {
            let result = if self.byte_range() {
                self.downgrade_range(file, current)
            } else if current >= LockType::Reserved {
                backend.lock(file, LockRange::SHARED, false).and_then(held)
            } else {
                Ok(())
            };
            return result.map_err(|_| Error::io(IoErrKind::RdLock));
        }

        let result = if self.byte_range() {
            backend
                .unlock(file, LockRange::SHARED)
                .and_then(|()| backend.unlock(file, LockRange::RESERVED))
                .and_then(|()| backend.unlock(file, LockRange::PENDING))
        } else {
            backend.unlock(file, LockRange::FILE)
        };
        result.map_err(|_| Error::io(IoErrKind::Unlock))
    }

    fn downgrade_range(&self, file: &File, current: LockType) -> io::Result<()> {
        let backend = &*self.backend;
        if current == LockType::Exclusive {
            if !backend.atomic_upgrade() {
                backend.unlock(file, LockRange::SHARED)?;
            }
            held(backend.lock(file, LockRange::SHARED, false)?)?;
        }
        backend.unlock(file, LockRange::RESERVED)?;
        backend.unlock(file, LockRange::PENDING)
    }

    /// Whether some handle holds RESERVED or higher
    pub fn check_reserved(&self, file: &File) -> Result<bool> {
        if self.state >= LockType::Reserved {
            return Ok(true);
        }
        let backend = &*self.backend;
        if !self.byte_range() {
            if self.state >= LockType::Shared {
                return Ok(false);
            }
            return backend
                .probe(file, LockRange::FILE)
                .map_err(|_| Error::io(IoErrKind::CheckReservedLock));
        }
        let probe = || -> io::Result<bool> {
            if backend.probe(file, LockRange::RESERVED)? {
                return Ok(true);
            }
            // EXCLUSIVE releases the reserved byte; its holder still owns the
            // shared range, which no one can share at that point
            if self.state == LockType::None {
                return backend.probe(file, LockRange::SHARED);
            }
            Ok(false)
        };
        probe().map_err(|_| Error::io(IoErrKind::CheckReservedLock))
    }
}

/// A downgrade that would block means the lock state is inconsistent
fn held(acquired: bool) -> io::Result<()> {
    if acquired {
        Ok(())
    } else {
        Err(io::Error::from(io::ErrorKind::WouldBlock))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::backend::BackendKind;
    use std::fs::OpenOptions;

    fn open(path: &std::path::Path) -> File {
        OpenOptions::new().read(true).write(true).open(path).unwrap()
    }

    fn pair(kind: BackendKind) -> (tempfile::NamedTempFile, File, File, FileLock, FileLock) {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let (fa, fb) = (open(tmp.path()), open(tmp.path()));
        let interval = Duration::from_millis(1);
        let a = FileLock::new(kind.backend(), false, interval);
        let b = FileLock::new(kind.backend(), false, interval);
        (tmp, fa, fb, a, b)
    }

    #[test]
    fn test_retry_zero_timeout_single_attempt() {
        let mut calls = 0;
        let acquired = retry(Duration::ZERO, Duration::from_millis(1), || {
            calls += 1;
            Ok(false)
        })
        .unwrap();
        assert!(!acquired);
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_retry_stops_on_success() {
        let mut calls = 0;
        let acquired = retry(Duration::from_secs(5), Duration::from_millis(1), || {
            calls += 1;
            Ok(calls == 3)
        })
        .unwrap();
        assert!(acquired);
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_busy_extended_code() {
        assert_eq!(busy(Duration::ZERO).extended_code(), ErrorCode::Busy as i32);
        assert_eq!(busy(Duration::from_millis(1)), Error::busy_timeout());
    }

    #[test]
    fn test_illegal_transitions_are_misuse() {
        for kind in BackendKind::available() {
            let (_tmp, fa, _fb, mut a, _b) = pair(kind);
            let err = a.lock(&fa, LockType::Reserved, Duration::ZERO).unwrap_err();
            assert_eq!(err.code, ErrorCode::Misuse);
            let err = a.lock(&fa, LockType::Exclusive, Duration::ZERO).unwrap_err();
            assert_eq!(err.code, ErrorCode::Misuse);
            a.lock(&fa, LockType::Shared, Duration::ZERO).unwrap();
            let err = a.lock(&fa, LockType::Pending, Duration::ZERO).unwrap_err();
            assert_eq!(err.code, ErrorCode::Misuse);
            let err = a.unlock(&fa, LockType::Reserved).unwrap_err();
            assert_eq!(err.code, ErrorCode::Misuse);
            assert_eq!(a.state(), LockType::Shared);
        }
    }

    #[test]
    fn test_read_only_cannot_reserve() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let file = File::open(tmp.path()).unwrap();
        let mut lock = FileLock::new(BackendKind::default().backend(), true, Duration::from_millis(1));
        lock.lock(&file, LockType::Shared, Duration::ZERO).unwrap();
        let err = lock.lock(&file, LockType::Reserved, Duration::ZERO).unwrap_err();
        assert_eq!(err.io_kind(), Some(IoErrKind::Lock));
        assert_eq!(lock.state(), LockType::Shared);
    }

    #[test]
    fn test_full_cycle() {
        for kind in BackendKind::available() {
            let (_tmp, fa, fb, mut a, mut b) = pair(kind);
            a.lock(&fa, LockType::Shared, Duration::ZERO).unwrap();
            a.lock(&fa, LockType::Reserved, Duration::ZERO).unwrap();
            assert!(a.check_reserved(&fa).unwrap());
            a.lock(&fa, LockType::Exclusive, Duration::ZERO).unwrap();
            assert_eq!(a.state(), LockType::Exclusive);

            assert!(b.check_reserved(&fb).unwrap(), "{kind}");
            assert_eq!(
                b.lock(&fb, LockType::Shared, Duration::ZERO).unwrap_err().code,
                ErrorCode::Busy
            );

            a.unlock(&fa, LockType::Shared).unwrap();
            b.lock(&fb, LockType::Shared, Duration::ZERO).unwrap();
            assert!(!b.check_reserved(&fb).unwrap());

            a.unlock(&fa, LockType::None).unwrap();
            b.unlock(&fb, LockType::None).unwrap();
            assert_eq!(a.state(), LockType::None);
        }
    }

    #[test]
    fn test_pending_blocks_new_readers() {
        for kind in BackendKind::available() {
            let (_tmp, fa, fb, mut a, mut b) = pair(kind);
            a.lock(&fa, LockType::Shared, Duration::ZERO).unwrap();
            a.lock(&fa, LockType::Reserved, Duration::ZERO).unwrap();
            a.lock(&fa, LockType::Pending, Duration::ZERO).unwrap();
            assert_eq!(
                b.lock(&fb, LockType::Shared, Duration::ZERO).unwrap_err().code,
                ErrorCode::Busy
            );
            a.unlock(&fa, LockType::None).unwrap();
            b.lock(&fb, LockType::Shared, Duration::ZERO).unwrap();
        }
    }

    #[test]
    fn test_exclusive_waits_for_readers() {
        for kind in BackendKind::available() {
            let (_tmp, fa, fb, mut a, mut b) = pair(kind);
            a.lock(&fa, LockType::Shared, Duration::ZERO).unwrap();
            b.lock(&fb, LockType::Shared, Duration::ZERO).unwrap();

            if kind.backend().granularity() == Granularity::WholeFile {
                // RESERVED needs the whole file to itself
                let err = a.lock(&fa, LockType::Reserved, Duration::ZERO).unwrap_err();
                assert_eq!(err.code, ErrorCode::Busy);
                assert_eq!(a.state(), LockType::Shared);
                continue;
            }

            a.lock(&fa, LockType::Reserved, Duration::ZERO).unwrap();
            let err = a.lock(&fa, LockType::Exclusive, Duration::ZERO).unwrap_err();
            assert_eq!(err.code, ErrorCode::Busy);
            assert_eq!(a.state(), LockType::Pending);

            // Still a reader: the failed upgrade kept the shared lock
            b.unlock(&fb, LockType::None).unwrap();
            assert!(b.check_reserved(&fb).unwrap());
            a.lock(&fa, LockType::Exclusive, Duration::ZERO).unwrap();
            assert_eq!(a.state(), LockType::Exclusive);
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_whole_file_reasserts_shared() {
        let (_tmp, fa, fb, mut a, mut b) = pair(BackendKind::Flock);
        a.lock(&fa, LockType::Shared, Duration::ZERO).unwrap();
        b.lock(&fb, LockType::Shared, Duration::ZERO).unwrap();
        a.lock(&fa, LockType::Reserved, Duration::ZERO).unwrap_err();
        assert_eq!(a.state(), LockType::Shared);

        // a is still a reader, so b cannot become the writer
        b.unlock(&fb, LockType::None).unwrap();
        b.lock(&fb, LockType::Shared, Duration::ZERO).unwrap();
        assert_eq!(
            b.lock(&fb, LockType::Reserved, Duration::ZERO).unwrap_err().code,
            ErrorCode::Busy
        );
    }
}
