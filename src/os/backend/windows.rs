//! Windows `LockFileEx` locks
//!
//! Range locks per handle. A shared lock cannot be converted to exclusive
//! in place: the caller must unlock the range first, which opens a window
//! where another handle can slip in.

use std::fs::File;
use std::io;
use std::os::windows::io::AsRawHandle;

use windows_sys::Win32::Foundation::{
    HANDLE, ERROR_IO_PENDING, ERROR_LOCK_VIOLATION, ERROR_NOT_LOCKED,
};
use windows_sys::Win32::Storage::FileSystem::{
    LockFileEx, UnlockFileEx, LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY,
};
use windows_sys::Win32::System::IO::OVERLAPPED;

use super::{BackendKind, Granularity, LockBackend, LockRange};

/// Byte-range locks through `LockFileEx`
#[derive(Debug, Default, Clone, Copy)]
pub struct WinBackend;

fn overlapped_at(offset: u64) -> OVERLAPPED {
    let mut overlapped: OVERLAPPED = unsafe { std::mem::zeroed() };
    overlapped.Anonymous.Anonymous.Offset = offset as u32;
    overlapped.Anonymous.Anonymous.OffsetHigh = (offset >> 32) as u32;
    overlapped
}

/// Lengths split into the low/high dwords `LockFileEx` expects; zero means
/// everything from `start` on
fn length_words(range: LockRange) -> (u32, u32) {
    let len = if range.len == 0 { u64::MAX - range.start } else { range.len };
    (len as u32, (len >> 32) as u32)
}

fn raw_handle(file: &File) -> HANDLE {
    file.as_raw_handle() as HANDLE
}

impl LockBackend for WinBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::LockFileEx
    }

    fn granularity(&self) -> Granularity {
        Granularity::ByteRange
    }

    fn atomic_upgrade(&self) -> bool {
        false
    }

    fn lock(&self, file: &File, range: LockRange, exclusive: bool) -> io::Result<bool> {
        let mut flags = LOCKFILE_FAIL_IMMEDIATELY;
        if exclusive {
            flags |= LOCKFILE_EXCLUSIVE_LOCK;
        }
        let (low, high) = length_words(range);
        let mut overlapped = overlapped_at(range.start);
        let rc = unsafe { LockFileEx(raw_handle(file), flags, 0, low, high, &mut overlapped) };
        if rc != 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error().map(|code| code as u32) {
            Some(ERROR_LOCK_VIOLATION) | Some(ERROR_IO_PENDING) => Ok(false),
            _ => Err(err),
        }
    }

    fn unlock(&self, file: &File, range: LockRange) -> io::Result<()> {
        let (low, high) = length_words(range);
        let mut overlapped = overlapped_at(range.start);
        let rc = unsafe { UnlockFileEx(raw_handle(file), 0, low, high, &mut overlapped) };
        if rc != 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error().map(|code| code as u32) == Some(ERROR_NOT_LOCKED) {
            return Ok(());
        }
        Err(err)
    }

    /// There is no query call; take and drop a shared lock instead. Only
    /// meaningful while `file` holds nothing on `range`.
    fn probe(&self, file: &File, range: LockRange) -> io::Result<bool> {
        if !self.lock(file, range, false)? {
            return Ok(true);
        }
        self.unlock(file, range)?;
        Ok(false)
    }
}
