//! The host VFS: real files, advisory locks and WAL shared memory
//!
//! [`HostVfs`] opens [`HostFile`]s; each file embeds one [`FileLock`] and,
//! once the engine asks for it, one attachment to the database's shared
//! memory region.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{fence, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::VfsConfig;
use crate::error::{Error, ErrorCode, HostFailure, IoErrKind, Result, CANTOPEN_ISDIR};
use crate::os::backend::LockBackend;
use crate::os::lock::FileLock;
use crate::os::shm::{ShmHandle, ShmRegistry, ShmSegment};
use crate::os::sys;
use crate::os::vfs::{
    AccessFlags, DeviceCharacteristics, FileControlOp, FileControlReply, LockType, OpenFlags,
    ShmLockFlags, SyncFlags, Vfs, VfsFile,
};

/// Counter for temporary file names
static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

// ============================================================================
// Host VFS
// ============================================================================

/// VFS backed by the host file system
#[derive(Debug)]
pub struct HostVfs {
    config: VfsConfig,
    backend: Arc<dyn LockBackend>,
    shm: ShmRegistry,
}

impl HostVfs {
    /// Create a host VFS with the default configuration
    pub fn new() -> Self {
        Self::with_config(VfsConfig::default())
    }

    /// Create a host VFS with a custom configuration
    pub fn with_config(config: VfsConfig) -> Self {
        let backend = config.backend.backend();
        let shm = ShmRegistry::new(
            Arc::clone(&backend),
            config.shared_memory,
            config.retry_interval,
        );
        tracing::debug!(
            name = %config.name,
            backend = %config.backend,
            shared_memory = shm.is_enabled(),
            "host vfs created"
        );
        Self {
            config,
            backend,
            shm,
        }
    }

    pub fn config(&self) -> &VfsConfig {
        &self.config
    }

    /// The shared memory regions this VFS hands out
    pub fn shm_registry(&self) -> &ShmRegistry {
        &self.shm
    }

    fn temp_path(&self) -> PathBuf {
        let n = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir().join(format!("{}-{}-{}.tmp", self.config.name, std::process::id(), n))
    }

    fn open_file(&self, path: &Path, flags: OpenFlags) -> Result<(File, OpenFlags)> {
        if path.is_dir() {
            return Err(Error::with_extended(ErrorCode::CantOpen, CANTOPEN_ISDIR));
        }

        let read_only = !flags.contains(OpenFlags::READWRITE);
        match sys::open_options(flags, read_only).open(path) {
            Ok(file) => Ok((file, flags)),
            Err(e) if sys::is_directory_failure(&e) => {
                Err(Error::with_extended(ErrorCode::CantOpen, CANTOPEN_ISDIR))
            }
            Err(e)
                if !read_only
                    && !flags.contains(OpenFlags::CREATE)
                    && sys::is_readonly_failure(&e) =>
            {
                let flags = (flags - OpenFlags::READWRITE) | OpenFlags::READONLY;
                tracing::debug!(path = %path.display(), "reopening read-only");
                let file = sys::open_options(flags, true)
                    .open(path)
                    .map_err(|e| cant_open(&e))?;
                Ok((file, flags))
            }
            Err(e) => Err(cant_open(&e)),
        }
    }
}

impl Default for HostVfs {
    fn default() -> Self {
        Self::new()
    }
}

/// Open failures are CANTOPEN unless a more specific code applies
fn cant_open(err: &io::Error) -> Error {
    match sys::classify(err) {
        Some(HostFailure::Full) => Error::new(ErrorCode::Full),
        Some(HostFailure::NoMem) => Error::new(ErrorCode::NoMem),
        _ => Error::new(ErrorCode::CantOpen),
    }
}

impl Vfs for HostVfs {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn open(&self, path: Option<&Path>, flags: OpenFlags) -> Result<(Box<dyn VfsFile>, OpenFlags)> {
        let (path, flags) = match path {
            Some(path) => (path.to_path_buf(), flags),
            None => (
                self.temp_path(),
                (flags - OpenFlags::READONLY)
                    | OpenFlags::READWRITE
                    | OpenFlags::CREATE
                    | OpenFlags::EXCLUSIVE
                    | OpenFlags::DELETEONCLOSE,
            ),
        };

        let (file, flags) = self.open_file(&path, flags)?;
        let read_only = flags.contains(OpenFlags::READONLY);
        let identity = sys::identity(&file).map_err(|e| Error::from_io(&e, IoErrKind::Fstat))?;

        tracing::trace!(path = %path.display(), ?flags, "file opened");
        let file = HostFile {
            file,
            path,
            flags,
            read_only,
            lock: FileLock::new(Arc::clone(&self.backend), read_only, self.config.retry_interval),
            lock_timeout: self.config.lock_timeout,
            backend: Arc::clone(&self.backend),
            registry: self.shm.clone(),
            shm: None,
            identity,
            delete_on_close: flags.contains(OpenFlags::DELETEONCLOSE),
            closed: false,
        };
        Ok((Box::new(file), flags))
    }

    fn delete(&self, path: &Path, sync_dir: bool) -> Result<()> {
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Error::io(IoErrKind::DeleteNoEnt));
            }
            Err(e) => return Err(Error::from_io(&e, IoErrKind::Delete)),
        }
        if sync_dir {
            sys::sync_dir(path).map_err(|e| Error::from_io(&e, IoErrKind::DirFsync))?;
        }
        Ok(())
    }

    fn access(&self, path: &Path, flags: AccessFlags) -> Result<bool> {
        sys::access(path, flags).map_err(|e| Error::from_io(&e, IoErrKind::Access))
    }

    fn full_pathname(&self, path: &Path) -> Result<PathBuf> {
        if let Ok(full) = fs::canonicalize(path) {
            return Ok(full);
        }
        if path.is_absolute() {
            return Ok(path.to_path_buf());
        }
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .map_err(|_| Error::new(ErrorCode::CantOpen))
    }
}

// ============================================================================
// Host File
// ============================================================================

/// An open file on the host
#[derive(Debug)]
pub struct HostFile {
    file: File,
    path: PathBuf,
    flags: OpenFlags,
    read_only: bool,
    lock: FileLock,
    lock_timeout: Duration,
    backend: Arc<dyn LockBackend>,
    registry: ShmRegistry,
    shm: Option<ShmHandle>,
    identity: (u64, u64),
    delete_on_close: bool,
    closed: bool,
}

impl HostFile {
    /// Path the file was opened under
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flags in effect
    pub fn flags(&self) -> OpenFlags {
        self.flags
    }

    /// Current lock level
    pub fn lock_state(&self) -> LockType {
        self.lock.state()
    }

    fn has_moved(&self) -> Result<bool> {
        if sys::link_count(&self.file).map_err(|e| Error::from_io(&e, IoErrKind::Fstat))? == 0 {
            return Ok(true);
        }
        match sys::path_identity(&self.path) {
            Ok(identity) => Ok(identity != self.identity),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(true),
            Err(e) => Err(Error::from_io(&e, IoErrKind::Fstat)),
        }
    }
}

impl VfsFile for HostFile {
    fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let n = sys::read_at(&self.file, buf, offset)
            .map_err(|e| Error::from_io(&e, IoErrKind::Read))?;
        if n < buf.len() {
            buf[n..].fill(0);
        }
        Ok(n)
    }

    fn write(&self, buf: &[u8], offset: u64) -> Result<()> {
        if self.read_only {
            return Err(Error::new(ErrorCode::ReadOnly));
        }
        sys::write_all_at(&self.file, buf, offset).map_err(|e| Error::from_io(&e, IoErrKind::Write))
    }

    fn truncate(&self, size: u64) -> Result<()> {
        self.file
            .set_len(size)
            .map_err(|e| Error::from_io(&e, IoErrKind::Truncate))
    }

    fn sync(&self, flags: SyncFlags) -> Result<()> {
        self.backend
            .sync(&self.file, flags.is_full(), flags.contains(SyncFlags::DATAONLY))
            .map_err(|e| Error::from_io(&e, IoErrKind::Fsync))
    }

    fn file_size(&self) -> Result<u64> {
        self.file
            .metadata()
            .map(|meta| meta.len())
            .map_err(|e| Error::from_io(&e, IoErrKind::Fstat))
    }

    fn lock(&mut self, lock_type: LockType) -> Result<()> {
        self.lock.lock(&self.file, lock_type, self.lock_timeout)
    }

    fn unlock(&mut self, lock_type: LockType) -> Result<()> {
        self.lock.unlock(&self.file, lock_type)
    }

    fn check_reserved_lock(&self) -> Result<bool> {
        self.lock.check_reserved(&self.file)
    }

    fn file_control(&mut self, op: FileControlOp) -> Result<FileControlReply> {
        match op {
            FileControlOp::LockState => Ok(FileControlReply::LockState(self.lock.state())),
            FileControlOp::SizeHint(size) => {
                if !self.read_only {
                    self.backend
                        .allocate(&self.file, size)
                        .map_err(|e| Error::from_io(&e, IoErrKind::Truncate))?;
                }
                Ok(FileControlReply::Done)
            }
            FileControlOp::LockTimeout(timeout) => {
                let previous = std::mem::replace(&mut self.lock_timeout, timeout);
                Ok(FileControlReply::LockTimeout(previous))
            }
            FileControlOp::HasMoved => Ok(FileControlReply::HasMoved(self.has_moved()?)),
        }
    }

    fn device_characteristics(&self) -> DeviceCharacteristics {
        DeviceCharacteristics::POWERSAFE_OVERWRITE
    }

    fn shm_map(&mut self, region: u32, size: usize, extend: bool) -> Result<Option<ShmSegment>> {
        if self.shm.is_none() {
            self.shm = self.registry.attach(&self.path, self.flags)?;
        }
        match &self.shm {
            Some(shm) => shm.map_segment(region, size, extend),
            None => Err(Error::io(IoErrKind::ShmMap)),
        }
    }

    fn shm_lock(&mut self, offset: u32, n: u32, flags: ShmLockFlags) -> Result<()> {
        match &mut self.shm {
            Some(shm) => shm.lock(offset, n, flags, self.lock_timeout),
            None => Err(Error::io(IoErrKind::ShmLock)),
        }
    }

    fn shm_barrier(&self) {
        match &self.shm {
            Some(shm) => shm.barrier(),
            None => fence(Ordering::SeqCst),
        }
    }

    fn shm_unmap(&mut self, delete: bool) -> Result<()> {
        match self.shm.take() {
            Some(shm) => shm.detach(delete),
            None => Ok(()),
        }
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        // Every step runs; the first failure is reported as is
        let unlocked = self.lock.unlock(&self.file, LockType::None);
        let detached = self.shm_unmap(false);
        let deleted = if self.delete_on_close {
            match fs::remove_file(&self.path) {
                Err(e) if e.kind() != io::ErrorKind::NotFound => {
                    Err(Error::from_io(&e, IoErrKind::Delete))
                }
                _ => Ok(()),
            }
        } else {
            Ok(())
        };
        tracing::trace!(path = %self.path.display(), "file closed");
        unlocked.and(detached).and(deleted)
    }
}

impl Drop for HostFile {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
