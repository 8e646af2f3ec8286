//! OS abstraction layer: VFS traits, lock backends, shared memory and the
//! host VFS built from them

pub mod backend;
pub mod host;
pub mod lock;
pub mod shm;
pub mod vfs;

#[cfg(unix)]
pub(crate) mod unix;
#[cfg(unix)]
pub(crate) use unix as sys;

#[cfg(windows)]
pub(crate) mod windows;
#[cfg(windows)]
pub(crate) use windows as sys;
