//! Open-file-description locks (Linux and Darwin)
//!
//! `F_OFD_SETLK` locks belong to the open file description, not the process,
//! so two `File`s opened on the same path conflict even within one process,
//! and closing one descriptor never drops locks held through another.

use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;

use super::{BackendKind, Granularity, LockBackend, LockRange};

#[cfg(target_os = "linux")]
use libc::{F_OFD_GETLK, F_OFD_SETLK};

// Darwin implements OFD locks but keeps the commands out of its public headers
#[cfg(target_vendor = "apple")]
const F_OFD_SETLK: libc::c_int = 90;
#[cfg(target_vendor = "apple")]
const F_OFD_GETLK: libc::c_int = 92;

/// Byte-range locks through `fcntl(F_OFD_SETLK)`
#[derive(Debug, Default, Clone, Copy)]
pub struct OfdBackend;

fn flock_for(range: LockRange, l_type: libc::c_int) -> libc::flock {
    // l_pid must be zero for OFD requests
    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = l_type as libc::c_short;
    fl.l_whence = libc::SEEK_SET as libc::c_short;
    fl.l_start = range.start as libc::off_t;
    fl.l_len = range.len as libc::off_t;
    fl
}

/// Issue one `fcntl` lock command, retrying on EINTR
fn fcntl_lock(file: &File, cmd: libc::c_int, fl: &mut libc::flock) -> io::Result<()> {
    loop {
        let rc = unsafe { libc::fcntl(file.as_raw_fd(), cmd, fl as *mut libc::flock) };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EINTR) {
            continue;
        }
        return Err(err);
    }
}

impl LockBackend for OfdBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Ofd
    }

    fn granularity(&self) -> Granularity {
        Granularity::ByteRange
    }

    fn atomic_upgrade(&self) -> bool {
        true
    }

    fn lock(&self, file: &File, range: LockRange, exclusive: bool) -> io::Result<bool> {
        let l_type = if exclusive { libc::F_WRLCK } else { libc::F_RDLCK };
        let mut fl = flock_for(range, l_type);
        match fcntl_lock(file, F_OFD_SETLK, &mut fl) {
            Ok(()) => Ok(true),
            Err(e) if matches!(e.raw_os_error(), Some(libc::EAGAIN) | Some(libc::EACCES)) => {
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    fn unlock(&self, file: &File, range: LockRange) -> io::Result<()> {
        let mut fl = flock_for(range, libc::F_UNLCK);
        fcntl_lock(file, F_OFD_SETLK, &mut fl)
    }

    fn probe(&self, file: &File, range: LockRange) -> io::Result<bool> {
        // F_OFD_GETLK ignores locks held through this same description
        let mut fl = flock_for(range, libc::F_WRLCK);
        fcntl_lock(file, F_OFD_GETLK, &mut fl)?;
        Ok(fl.l_type != libc::F_UNLCK as libc::c_short)
    }
}
