//! WAL-index shared memory
//!
//! Every connection to a WAL database shares one index, kept in a file named
//! `<database>-shm` and mapped into each process with `MAP_SHARED`. Within a
//! process all handles on the same database share one [`ShmRegion`], so each
//! segment is mapped once and every handle sees the same addresses.
//!
//! Layout of the lock bytes in the shm file:
//!
//! | byte | use |
//! |---|---|
//! | 120 | WAL write lock |
//! | 121 | checkpoint lock |
//! | 122 | recovery lock |
//! | 123..128 | read marks 0-4 |
//! | 128 | dead-man switch |
//!
//! The dead-man switch tells a process whether it is the first to open the
//! file: whoever wins an exclusive lock on it may discard stale contents.
//!
//! Whole-file backends cannot lock single bytes. Their regions are process
//! local instead: the opener holds an exclusive lock on the whole shm file for
//! the region's lifetime, and slots are arbitrated only by the in-process
//! counters. Other processes get `Busy` until the region closes.

use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{fence, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use memmap2::{MmapOptions, MmapRaw};
use parking_lot::Mutex;

use crate::error::{Error, ErrorCode, IoErrKind, Result, READONLY_CANTINIT};
use crate::os::backend::{Granularity, LockBackend, LockRange};
use crate::os::lock::{busy, retry};
use crate::os::sys;
use crate::os::vfs::{OpenFlags, ShmLockFlags};

/// Whether this build can hand out shared memory at all
pub const SUPPORTS_SHARED_MEMORY: bool = cfg!(not(feature = "noshm"));

/// Number of lock slots
pub const SHM_NLOCK: u32 = 8;
/// Offset of the first lock slot in the shm file
const SHM_LOCK_BASE: u64 = 120;
/// Offset of the dead-man switch
const SHM_DMS: u64 = SHM_LOCK_BASE + SHM_NLOCK as u64;

fn slot_range(slot: u32) -> LockRange {
    LockRange::new(SHM_LOCK_BASE + slot as u64, 1)
}

/// Path of the shm file for a database
pub fn shm_path(db_path: &Path) -> PathBuf {
    let mut name = db_path.as_os_str().to_os_string();
    name.push("-shm");
    PathBuf::from(name)
}

// ============================================================================
// Segment
// ============================================================================

/// One mapped segment of the WAL index.
///
/// Holding a segment keeps its mapping alive, even past the region's
/// teardown. The memory is shared with other processes: plain reads and
/// writes through [`as_ptr`](Self::as_ptr) race with them, so callers
/// coordinate through [`ShmHandle::lock`].
#[derive(Debug, Clone)]
pub struct ShmSegment {
    map: Arc<MmapRaw>,
    read_only: bool,
}

impl ShmSegment {
    /// Base address of the segment
    pub fn as_ptr(&self) -> *mut u8 {
        self.map.as_mut_ptr()
    }

    /// Segment length in bytes
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.len() == 0
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn check_bounds(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len() => Ok(()),
            _ => Err(Error::new(ErrorCode::Misuse)),
        }
    }

    fn check_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(Error::new(ErrorCode::ReadOnly));
        }
        Ok(())
    }

    /// Copy `buf.len()` bytes out of the segment
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.check_bounds(offset, buf.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(self.as_ptr().add(offset), buf.as_mut_ptr(), buf.len());
        }
        Ok(())
    }

    /// Copy `buf` into the segment
    pub fn write_at(&self, offset: usize, buf: &[u8]) -> Result<()> {
        self.check_bounds(offset, buf.len())?;
        self.check_writable()?;
        unsafe {
            std::ptr::copy_nonoverlapping(buf.as_ptr(), self.as_ptr().add(offset), buf.len());
        }
        Ok(())
    }

    fn atomic_u32(&self, offset: usize) -> Result<&AtomicU32> {
        self.check_bounds(offset, 4)?;
        if offset % 4 != 0 {
            return Err(Error::new(ErrorCode::Misuse));
        }
        // Mappings are page aligned, so an aligned offset is an aligned address
        Ok(unsafe { &*(self.as_ptr().add(offset) as *const AtomicU32) })
    }

    /// Atomically load a native-endian word at a 4-byte aligned offset
    pub fn read_u32(&self, offset: usize) -> Result<u32> {
        Ok(self.atomic_u32(offset)?.load(Ordering::SeqCst))
    }

    /// Atomically store a native-endian word at a 4-byte aligned offset
    pub fn write_u32(&self, offset: usize, value: u32) -> Result<()> {
        self.check_writable()?;
        self.atomic_u32(offset)?.store(value, Ordering::SeqCst);
        Ok(())
    }
}

// ============================================================================
// Region
// ============================================================================

/// The shared state behind one shm file in this process
#[derive(Debug)]
pub struct ShmRegion {
    path: PathBuf,
    backend: Arc<dyn LockBackend>,
    /// Slots never reach the OS; the whole file is ours
    process_local: bool,
    state: Mutex<RegionState>,
}

#[derive(Debug)]
struct RegionState {
    file: File,
    /// The file could only be opened read-only
    read_only: bool,
    closed: bool,
    segment_size: usize,
    segments: Vec<Arc<MmapRaw>>,
    /// Per slot: > 0 shared holders, -1 exclusive, 0 free
    lock_counts: [i32; SHM_NLOCK as usize],
}

impl ShmRegion {
    fn open(path: PathBuf, backend: Arc<dyn LockBackend>) -> Result<Self> {
        let (file, read_only) = open_shm_file(&path)?;
        let process_local = backend.granularity() == Granularity::WholeFile;
        let lock_err = |e: io::Error| Error::from_lock_io(&e, IoErrKind::ShmOpen);

        // Whoever holds the file exclusively is alone: whatever it holds is stale
        let reset = |file: &File| {
            file.set_len(0)
                .map_err(|e| Error::from_io(&e, IoErrKind::ShmOpen))
        };

        let first = if process_local {
            if !backend.lock(&file, LockRange::FILE, true).map_err(lock_err)? {
                return Err(Error::new(ErrorCode::Busy));
            }
            if !read_only {
                reset(&file)?;
            }
            !read_only
        } else {
            let dms = LockRange::new(SHM_DMS, 1);
            let first = !read_only && backend.lock(&file, dms, true).map_err(lock_err)?;
            if first {
                reset(&file)?;
                if !backend.atomic_upgrade() {
                    backend.unlock(&file, dms).map_err(lock_err)?;
                }
            }
            if !backend.lock(&file, dms, false).map_err(lock_err)? {
                return Err(Error::new(ErrorCode::Busy));
            }
            first
        };

        tracing::debug!(path = %path.display(), first, read_only, process_local, "shm region opened");
        Ok(Self {
            path,
            backend,
            process_local,
            state: Mutex::new(RegionState {
                file,
                read_only,
                closed: false,
                segment_size: 0,
                segments: Vec::new(),
                lock_counts: [0; SHM_NLOCK as usize],
            }),
        })
    }

    /// Give up the region's hold on the shm file. Mappings handed out stay
    /// valid; the next opener may reset the contents.
    fn close(&self) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        let range = if self.process_local {
            LockRange::FILE
        } else {
            LockRange::new(SHM_DMS, 1)
        };
        let _ = self.backend.unlock(&state.file, range);
        tracing::debug!(path = %self.path.display(), "shm region closed");
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn map_segment(
        &self,
        index: u32,
        size: usize,
        extend: bool,
        handle_read_only: bool,
    ) -> Result<Option<ShmSegment>> {
        if size == 0 {
            return Err(Error::io(IoErrKind::ShmMap));
        }
        let mut state = self.state.lock();
        let read_only = handle_read_only || state.read_only;
        if state.segment_size == 0 {
            state.segment_size = size;
        } else if state.segment_size != size {
            return Err(Error::io(IoErrKind::ShmMap));
        }

        let file_len = state
            .file
            .metadata()
            .map_err(|e| Error::from_io(&e, IoErrKind::ShmSize))?
            .len();

        if !state.segments.is_empty() {
            if sys::link_count(&state.file).map_err(|e| Error::from_io(&e, IoErrKind::ShmOpen))? == 0 {
                return Err(Error::io(IoErrKind::ShmOpen));
            }
            let mapped = (state.segments.len() * size) as u64;
            if file_len < mapped {
                return Err(Error::io(IoErrKind::ShmSize));
            }
        }

        let index = index as usize;
        if let Some(map) = state.segments.get(index) {
            return Ok(Some(ShmSegment {
                map: Arc::clone(map),
                read_only,
            }));
        }

        let required = ((index + 1) * size) as u64;
        if file_len < required {
            if !extend {
                return Ok(None);
            }
            if read_only {
                return Err(Error::with_extended(ErrorCode::ReadOnly, READONLY_CANTINIT));
            }
            self.backend
                .allocate(&state.file, required)
                .map_err(|e| Error::from_io(&e, IoErrKind::ShmSize))?;
        }

        while state.segments.len() <= index {
            let offset = (state.segments.len() * size) as u64;
            let mut options = MmapOptions::new();
            options.offset(offset).len(size);
            let map = if state.read_only {
                options.map_raw_read_only(&state.file)
            } else {
                options.map_raw(&state.file)
            }
            .map_err(|e| match e.kind() {
                io::ErrorKind::OutOfMemory => Error::new(ErrorCode::NoMem),
                _ => Error::from_io(&e, IoErrKind::ShmMap),
            })?;
            state.segments.push(Arc::new(map));
        }

        Ok(Some(ShmSegment {
            map: Arc::clone(&state.segments[index]),
            read_only,
        }))
    }
}

impl Drop for ShmRegion {
    fn drop(&mut self) {
        // Segments handed out may outlive the region and keep the file
        // description alive; the lock must not
        self.close();
    }
}

/// Open the shm file read-write, falling back to read-only where the host
/// refuses writes. A missing file cannot be created read-only.
fn open_shm_file(path: &Path) -> Result<(File, bool)> {
    let err = match sys::open_options(OpenFlags::READWRITE | OpenFlags::CREATE, false).open(path) {
        Ok(file) => return Ok((file, false)),
        Err(e) => e,
    };
    if !sys::is_readonly_failure(&err) {
        return Err(Error::from_io(&err, IoErrKind::ShmOpen));
    }
    match sys::open_options(OpenFlags::READONLY, true).open(path) {
        Ok(file) => Ok((file, true)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            Err(Error::with_extended(ErrorCode::ReadOnly, READONLY_CANTINIT))
        }
        Err(e) => Err(Error::from_io(&e, IoErrKind::ShmOpen)),
    }
}

// ============================================================================
// Registry
// ============================================================================

struct Entry {
    region: Arc<ShmRegion>,
    refs: usize,
}

struct RegistryInner {
    regions: Mutex<HashMap<PathBuf, Entry>>,
    backend: Arc<dyn LockBackend>,
    enabled: bool,
    retry_interval: Duration,
}

/// Process-wide table of open shm regions, keyed by canonical database path
#[derive(Clone)]
pub struct ShmRegistry {
    inner: Arc<RegistryInner>,
}

impl std::fmt::Debug for ShmRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShmRegistry")
            .field("backend", &self.inner.backend.kind())
            .field("enabled", &self.inner.enabled)
            .field("regions", &self.inner.regions.lock().len())
            .finish()
    }
}

impl ShmRegistry {
    /// Regions of whole-file backends are confined to this process
    pub fn new(backend: Arc<dyn LockBackend>, enabled: bool, retry_interval: Duration) -> Self {
        let enabled = enabled && SUPPORTS_SHARED_MEMORY;
        Self {
            inner: Arc::new(RegistryInner {
                regions: Mutex::new(HashMap::new()),
                backend,
                enabled,
                retry_interval,
            }),
        }
    }

    /// Whether `attach` can ever return a handle
    pub fn is_enabled(&self) -> bool {
        self.inner.enabled
    }

    /// Number of regions currently open
    pub fn region_count(&self) -> usize {
        self.inner.regions.lock().len()
    }

    /// Attach to the WAL index of the database at `db_path`.
    ///
    /// Returns `None` when shared memory is unavailable or inappropriate:
    /// only persistent main databases get a WAL index.
    pub fn attach(&self, db_path: &Path, flags: OpenFlags) -> Result<Option<ShmHandle>> {
        if !self.inner.enabled
            || !flags.contains(OpenFlags::MAIN_DB)
            || flags.intersects(OpenFlags::MEMORY | OpenFlags::DELETEONCLOSE)
        {
            return Ok(None);
        }

        let key = canonical(db_path)?;
        let read_only = flags.contains(OpenFlags::READONLY);

        let mut regions = self.inner.regions.lock();
        let region = match regions.get_mut(&key) {
            Some(entry) => {
                entry.refs += 1;
                Arc::clone(&entry.region)
            }
            None => {
                let region = Arc::new(ShmRegion::open(
                    shm_path(&key),
                    Arc::clone(&self.inner.backend),
                )?);
                regions.insert(
                    key.clone(),
                    Entry {
                        region: Arc::clone(&region),
                        refs: 1,
                    },
                );
                region
            }
        };
        drop(regions);

        Ok(Some(ShmHandle {
            registry: self.clone(),
            key,
            region,
            read_only,
            held: [Hold::None; SHM_NLOCK as usize],
            detached: false,
        }))
    }

    fn release(&self, key: &Path, delete: bool) -> Result<()> {
        let mut regions = self.inner.regions.lock();
        let Some(entry) = regions.get_mut(key) else {
            return Ok(());
        };
        entry.refs -= 1;
        if entry.refs > 0 {
            return Ok(());
        }
        let entry = regions.remove(key);
        // Release the file before anyone can open the region again
        if let Some(entry) = &entry {
            entry.region.close();
        }
        drop(regions);

        if let (Some(entry), true) = (entry, delete) {
            match std::fs::remove_file(entry.region.path()) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::from_io(&e, IoErrKind::Delete)),
            }
        }
        Ok(())
    }
}

/// Canonical form of a database path; a file that does not exist yet is
/// resolved against the working directory
fn canonical(path: &Path) -> Result<PathBuf> {
    match std::fs::canonicalize(path) {
        Ok(path) => Ok(path),
        Err(_) if path.is_absolute() => Ok(path.to_path_buf()),
        Err(_) => std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .map_err(|e| Error::from_io(&e, IoErrKind::ShmOpen)),
    }
}

// ============================================================================
// Handle
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Hold {
    None,
    Shared,
    Exclusive,
}

/// One file handle's attachment to a shm region
#[derive(Debug)]
pub struct ShmHandle {
    registry: ShmRegistry,
    key: PathBuf,
    region: Arc<ShmRegion>,
    read_only: bool,
    held: [Hold; SHM_NLOCK as usize],
    detached: bool,
}

impl ShmHandle {
    /// Path of the shm file
    pub fn path(&self) -> &Path {
        self.region.path()
    }

    /// Map segment `index` of `size` bytes. With `extend` the file grows as
    /// needed; without it a segment past the end of the file is `None`.
    /// Segments are writable only through a read-write handle.
    pub fn map_segment(&self, index: u32, size: usize, extend: bool) -> Result<Option<ShmSegment>> {
        self.region.map_segment(index, size, extend, self.read_only)
    }

    /// Lock or unlock slots `offset..offset + n`. Acquisition waits up to
    /// `timeout`; a partial acquisition is rolled back.
    pub fn lock(&mut self, offset: u32, n: u32, flags: ShmLockFlags, timeout: Duration) -> Result<()> {
        if !flags.is_valid() || n == 0 || offset.checked_add(n).map_or(true, |end| end > SHM_NLOCK) {
            return Err(Error::new(ErrorCode::Misuse));
        }
        let slots = offset..offset + n;
        let region = Arc::clone(&self.region);

        if flags.contains(ShmLockFlags::UNLOCK) {
            let mut state = region.state.lock();
            let mut result = Ok(());
            for slot in slots {
                let released = self.release_slot(&mut state, slot);
                result = result.and(released);
            }
            tracing::trace!(offset, n, "shm slots released");
            return result.map_err(|e| Error::from_io(&e, IoErrKind::ShmLock));
        }

        let exclusive = flags.contains(ShmLockFlags::EXCLUSIVE);
        // Slots are never upgraded in place
        if exclusive && slots.clone().any(|slot| self.held[slot as usize] == Hold::Shared) {
            return Err(Error::new(ErrorCode::Misuse));
        }

        let interval = self.registry.inner.retry_interval;
        let acquired = retry(timeout, interval, || {
            let mut state = region.state.lock();
            let mut taken = Vec::new();
            for slot in slots.clone() {
                match self.acquire_slot(&mut state, slot, exclusive) {
                    Ok(Take::New) => taken.push(slot),
                    Ok(Take::Held) => {}
                    outcome => {
                        let mut rolled_back = Ok(());
                        for &slot in taken.iter().rev() {
                            let released = self.release_slot(&mut state, slot);
                            rolled_back = rolled_back.and(released);
                        }
                        return outcome.and_then(|_| rolled_back).map(|()| false);
                    }
                }
            }
            Ok(true)
        })
        .map_err(|e| Error::from_lock_io(&e, IoErrKind::ShmLock))?;

        if !acquired {
            return Err(busy(timeout));
        }
        tracing::trace!(offset, n, exclusive, "shm slots acquired");
        Ok(())
    }

    fn acquire_slot(&mut self, state: &mut RegionState, slot: u32, exclusive: bool) -> io::Result<Take> {
        let i = slot as usize;
        match (self.held[i], exclusive) {
            (Hold::Exclusive, _) | (Hold::Shared, false) => return Ok(Take::Held),
            _ => {}
        }

        let count = state.lock_counts[i];
        let backend = &self.region.backend;
        let local = self.region.process_local;
        if exclusive {
            if count != 0 || !(local || backend.lock(&state.file, slot_range(slot), true)?) {
                return Ok(Take::Busy);
            }
            state.lock_counts[i] = -1;
            self.held[i] = Hold::Exclusive;
        } else {
            if count < 0
                || (count == 0 && !(local || backend.lock(&state.file, slot_range(slot), false)?))
            {
                return Ok(Take::Busy);
            }
            state.lock_counts[i] += 1;
            self.held[i] = Hold::Shared;
        }
        Ok(Take::New)
    }

    /// Drop this handle's hold on `slot`; the OS lock goes with the last
    /// holder in the process
    fn release_slot(&mut self, state: &mut RegionState, slot: u32) -> io::Result<()> {
        let i = slot as usize;
        match self.held[i] {
            Hold::None => return Ok(()),
            Hold::Shared => state.lock_counts[i] -= 1,
            Hold::Exclusive => state.lock_counts[i] = 0,
        }
        self.held[i] = Hold::None;
        if state.lock_counts[i] == 0 && !self.region.process_local {
            self.region.backend.unlock(&state.file, slot_range(slot))?;
        }
        Ok(())
    }

    /// Full memory barrier between this process and others sharing the index
    pub fn barrier(&self) {
        fence(Ordering::SeqCst);
    }

    /// Release held slots and leave the region. The last handle out closes
    /// it and, with `delete`, removes the shm file.
    pub fn detach(mut self, delete: bool) -> Result<()> {
        self.release(delete)
    }

    fn release(&mut self, delete: bool) -> Result<()> {
        if self.detached {
            return Ok(());
        }
        self.detached = true;

        let region = Arc::clone(&self.region);
        let mut unlocked = Ok(());
        {
            let mut state = region.state.lock();
            for slot in 0..SHM_NLOCK {
                let released = self.release_slot(&mut state, slot);
                unlocked = unlocked.and(released);
            }
        }
        self.registry.release(&self.key, delete)?;
        unlocked.map_err(|e| Error::from_io(&e, IoErrKind::ShmLock))
    }
}

impl Drop for ShmHandle {
    fn drop(&mut self) {
        let _ = self.release(false);
    }
}

/// Outcome of one slot acquisition attempt
enum Take {
    New,
    Held,
    Busy,
}
