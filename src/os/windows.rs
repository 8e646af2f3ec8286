//! Windows host helpers
//!
//! Win32 counterparts of the Unix helpers: error classification, positional
//! I/O, sync, preallocation and identity checks.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::windows::fs::{FileExt, OpenOptionsExt};
use std::os::windows::io::AsRawHandle;
use std::path::Path;

use windows_sys::Win32::Foundation::{
    ERROR_ACCESS_DENIED, ERROR_DIRECTORY, ERROR_DISK_FULL, ERROR_HANDLE_DISK_FULL, ERROR_HANDLE_EOF,
    ERROR_LOCK_VIOLATION, ERROR_NOT_ENOUGH_MEMORY, ERROR_OUTOFMEMORY, ERROR_SHARING_VIOLATION,
    ERROR_WRITE_PROTECT, HANDLE,
};
use windows_sys::Win32::Storage::FileSystem::{
    GetFileInformationByHandle, BY_HANDLE_FILE_INFORMATION, FILE_SHARE_DELETE, FILE_SHARE_READ,
    FILE_SHARE_WRITE,
};

use crate::error::HostFailure;
use crate::os::vfs::{AccessFlags, OpenFlags};

const FILE_SHARE_FLAGS: u32 = FILE_SHARE_READ | FILE_SHARE_WRITE | FILE_SHARE_DELETE;

// ============================================================================
// Error classification
// ============================================================================

pub(crate) fn classify(err: &io::Error) -> Option<HostFailure> {
    let code = err.raw_os_error()? as u32;
    match code {
        ERROR_DISK_FULL | ERROR_HANDLE_DISK_FULL => Some(HostFailure::Full),
        ERROR_NOT_ENOUGH_MEMORY | ERROR_OUTOFMEMORY => Some(HostFailure::NoMem),
        ERROR_ACCESS_DENIED => Some(HostFailure::Perm),
        ERROR_WRITE_PROTECT => Some(HostFailure::ReadOnly),
        ERROR_LOCK_VIOLATION | ERROR_SHARING_VIOLATION => Some(HostFailure::Contention),
        _ => None,
    }
}

/// Windows reports lock conflicts with their own codes
pub(crate) fn is_lock_conflict(_err: &io::Error) -> bool {
    false
}

pub(crate) fn is_readonly_failure(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error().map(|code| code as u32),
        Some(ERROR_ACCESS_DENIED) | Some(ERROR_WRITE_PROTECT)
    )
}

pub(crate) fn is_directory_failure(err: &io::Error) -> bool {
    err.raw_os_error().map(|code| code as u32) == Some(ERROR_DIRECTORY)
}

// ============================================================================
// Opening
// ============================================================================

/// Share read, write and delete so other handles can open and unlink
pub(crate) fn open_options(flags: OpenFlags, read_only: bool) -> OpenOptions {
    let mut options = OpenOptions::new();
    options.read(true).write(!read_only).share_mode(FILE_SHARE_FLAGS);
    if !read_only && flags.contains(OpenFlags::CREATE) {
        if flags.contains(OpenFlags::EXCLUSIVE) {
            options.create_new(true);
        } else {
            options.create(true);
        }
    }
    options
}

// ============================================================================
// Positional I/O
// ============================================================================

pub(crate) fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    let mut done = 0;
    while done < buf.len() {
        match file.seek_read(&mut buf[done..], offset + done as u64) {
            Ok(0) => break,
            Ok(n) => done += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            // Reading past the end reports ERROR_HANDLE_EOF
            Err(e) if e.raw_os_error() == Some(ERROR_HANDLE_EOF as i32) => break,
            Err(e) => return Err(e),
        }
    }
    Ok(done)
}

pub(crate) fn write_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
    while !buf.is_empty() {
        match file.seek_write(buf, offset) {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
            Ok(n) => {
                buf = &buf[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

// ============================================================================
// Durability
// ============================================================================

/// `FlushFileBuffers` has no data-only or full variant
pub(crate) fn sync(file: &File, _full: bool, _data_only: bool) -> io::Result<()> {
    file.sync_all()
}

pub(crate) fn allocate(file: &File, size: u64) -> io::Result<()> {
    if file.metadata()?.len() >= size {
        return Ok(());
    }
    file.set_len(size)
}

/// Directory entries are durable once the call returns
pub(crate) fn sync_dir(_path: &Path) -> io::Result<()> {
    Ok(())
}

// ============================================================================
// Identity
// ============================================================================

fn file_information(file: &File) -> io::Result<BY_HANDLE_FILE_INFORMATION> {
    let mut info: BY_HANDLE_FILE_INFORMATION = unsafe { std::mem::zeroed() };
    let rc = unsafe { GetFileInformationByHandle(file.as_raw_handle() as HANDLE, &mut info) };
    if rc == 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(info)
}

/// Volume serial number and file index
pub(crate) fn identity(file: &File) -> io::Result<(u64, u64)> {
    let info = file_information(file)?;
    let index = ((info.nFileIndexHigh as u64) << 32) | info.nFileIndexLow as u64;
    Ok((info.dwVolumeSerialNumber as u64, index))
}

pub(crate) fn path_identity(path: &Path) -> io::Result<(u64, u64)> {
    let file = open_options(OpenFlags::empty(), true).open(path)?;
    identity(&file)
}

pub(crate) fn link_count(file: &File) -> io::Result<u64> {
    Ok(file_information(file)?.nNumberOfLinks as u64)
}

// ============================================================================
// Access
// ============================================================================

pub(crate) fn access(path: &Path, flags: AccessFlags) -> io::Result<bool> {
    let meta = match std::fs::metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    if flags.contains(AccessFlags::READWRITE) {
        return Ok(!meta.permissions().readonly());
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_win_allocate_never_shrinks() {
        let file = tempfile::tempfile().unwrap();
        allocate(&file, 8192).unwrap();
        allocate(&file, 100).unwrap();
        assert_eq!(file.metadata().unwrap().len(), 8192);
    }

    #[test]
    fn test_win_classify() {
        let err = |n: u32| io::Error::from_raw_os_error(n as i32);
        assert_eq!(classify(&err(ERROR_DISK_FULL)), Some(HostFailure::Full));
        assert_eq!(
            classify(&err(ERROR_LOCK_VIOLATION)),
            Some(HostFailure::Contention)
        );
    }
}
