//! Unix host helpers
//!
//! Thin wrappers over the file calls the VFS needs beyond `std::fs`:
//! errno classification, positional I/O, durable sync, preallocation, and
//! the identity checks used to detect a deleted or replaced file.

use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileExt, MetadataExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::Path;

use crate::error::HostFailure;
use crate::os::vfs::{AccessFlags, OpenFlags};

// ============================================================================
// Error classification
// ============================================================================

/// Sort an OS error into the classes that have a specific engine code
pub(crate) fn classify(err: &io::Error) -> Option<HostFailure> {
    let errno = err.raw_os_error()?;
    match errno {
        libc::ENOSPC | libc::EDQUOT => Some(HostFailure::Full),
        libc::ENOMEM => Some(HostFailure::NoMem),
        libc::EACCES | libc::EPERM => Some(HostFailure::Perm),
        libc::EROFS => Some(HostFailure::ReadOnly),
        libc::EAGAIN | libc::EBUSY | libc::EINTR | libc::ENOLCK | libc::EDEADLK
        | libc::ETIMEDOUT => Some(HostFailure::Contention),
        _ => None,
    }
}

/// POSIX allows `fcntl` to report a conflicting lock as EACCES
pub(crate) fn is_lock_conflict(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::EACCES)
}

/// Whether a failed open should be retried read-only
pub(crate) fn is_readonly_failure(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EACCES) | Some(libc::EPERM) | Some(libc::EROFS)
    )
}

/// Whether a failed open hit a directory
pub(crate) fn is_directory_failure(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::EISDIR)
}

// ============================================================================
// Opening
// ============================================================================

/// Platform open options: mode 0644, optional `O_NOFOLLOW`
pub(crate) fn open_options(flags: OpenFlags, read_only: bool) -> OpenOptions {
    let mut options = OpenOptions::new();
    options.read(true).write(!read_only).mode(0o644);
    if !read_only && flags.contains(OpenFlags::CREATE) {
        if flags.contains(OpenFlags::EXCLUSIVE) {
            options.create_new(true);
        } else {
            options.create(true);
        }
    }
    if flags.contains(OpenFlags::NOFOLLOW) {
        options.custom_flags(libc::O_NOFOLLOW);
    }
    options
}

// ============================================================================
// Positional I/O
// ============================================================================

/// Read as much of `buf` as the file holds at `offset`
pub(crate) fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    let mut done = 0;
    while done < buf.len() {
        match file.read_at(&mut buf[done..], offset + done as u64) {
            Ok(0) => break,
            Ok(n) => done += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(done)
}

/// Write all of `buf` at `offset`
pub(crate) fn write_all_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    file.write_all_at(buf, offset)
}

// ============================================================================
// Durability
// ============================================================================

/// Flush to disk; `F_FULLFSYNC` on Apple platforms when `full` is set
pub(crate) fn sync(file: &File, full: bool, data_only: bool) -> io::Result<()> {
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    {
        if full {
            let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_FULLFSYNC) };
            if rc == 0 {
                return Ok(());
            }
            // Some filesystems reject F_FULLFSYNC; fall back to fsync
        }
    }
    #[cfg(not(any(target_os = "macos", target_os = "ios")))]
    let _ = full;

    if data_only {
        platform_fdatasync(file)
    } else {
        file.sync_all()
    }
}

#[cfg(target_os = "linux")]
fn platform_fdatasync(file: &File) -> io::Result<()> {
    file.sync_data()
}

/// fdatasync is not reliable on every platform; use fsync
#[cfg(not(target_os = "linux"))]
fn platform_fdatasync(file: &File) -> io::Result<()> {
    file.sync_all()
}

/// Grow the file to at least `size` bytes, reserving blocks where possible
pub(crate) fn allocate(file: &File, size: u64) -> io::Result<()> {
    if file.metadata()?.len() >= size {
        return Ok(());
    }

    #[cfg(target_os = "linux")]
    {
        let rc = unsafe { libc::posix_fallocate(file.as_raw_fd(), 0, size as libc::off_t) };
        match rc {
            0 => return Ok(()),
            // Filesystems without fallocate support
            libc::EOPNOTSUPP | libc::EINVAL => {}
            errno => return Err(io::Error::from_raw_os_error(errno)),
        }
    }

    file.set_len(size)
}

/// Sync the directory containing `path` so a create or unlink is durable
pub(crate) fn sync_dir(path: &Path) -> io::Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    File::open(dir)?.sync_all()
}

// ============================================================================
// Identity
// ============================================================================

/// Device and inode: two handles with equal identity refer to one file
pub(crate) fn identity(file: &File) -> io::Result<(u64, u64)> {
    let meta = file.metadata()?;
    Ok((meta.dev(), meta.ino()))
}

/// Identity of whatever `path` names now
pub(crate) fn path_identity(path: &Path) -> io::Result<(u64, u64)> {
    let meta = std::fs::metadata(path)?;
    Ok((meta.dev(), meta.ino()))
}

/// Hard links left on the open file; zero once it has been unlinked
pub(crate) fn link_count(file: &File) -> io::Result<u64> {
    Ok(file.metadata()?.nlink())
}

// ============================================================================
// Access
// ============================================================================

/// `access(2)` for the requested mode
pub(crate) fn access(path: &Path, flags: AccessFlags) -> io::Result<bool> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;

    let mode = if flags.contains(AccessFlags::READWRITE) {
        libc::R_OK | libc::W_OK
    } else if flags.contains(AccessFlags::READ) {
        libc::R_OK
    } else {
        libc::F_OK
    };

    let rc = unsafe { libc::access(c_path.as_ptr(), mode) };
    if rc == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::ENOENT) | Some(libc::EACCES) | Some(libc::EROFS) | Some(libc::ENOTDIR) => {
            Ok(false)
        }
        _ => Err(err),
    }
}
