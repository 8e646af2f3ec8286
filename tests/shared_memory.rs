//! WAL-index shared memory through the host VFS.

use std::fs::{self, OpenOptions};
use std::path::Path;
use std::thread;

use hostvfs::error::READONLY_CANTINIT;
use hostvfs::os::shm::shm_path;
use hostvfs::{
    BackendKind, ErrorCode, HostVfs, IoErrKind, OpenFlags, ShmLockFlags, VfsConfig, Vfs, VfsFile,
};
use tempfile::tempdir;

const SEGMENT: usize = 32 * 1024;

fn main_db() -> OpenFlags {
    OpenFlags::READWRITE | OpenFlags::CREATE | OpenFlags::MAIN_DB
}

fn open(vfs: &HostVfs, path: &Path, flags: OpenFlags) -> Box<dyn VfsFile> {
    vfs.open(Some(path), flags).unwrap().0
}

/// Every backend hands out shared memory; whole-file ones keep it in-process
fn shm_backends() -> Vec<BackendKind> {
    BackendKind::available()
}

fn vfs(kind: BackendKind) -> HostVfs {
    HostVfs::with_config(VfsConfig::default().backend(kind).shared_memory(true))
}

#[test]
fn test_handles_share_one_mapping() {
    if !hostvfs::SUPPORTS_SHARED_MEMORY {
        return;
    }
    for kind in shm_backends() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("shared.db");
        let vfs = vfs(kind);
        let mut a = open(&vfs, &path, main_db());
        let mut b = open(&vfs, &path, main_db());

        let seg_a = a.shm_map(0, SEGMENT, true).unwrap().unwrap();
        let seg_b = b.shm_map(0, SEGMENT, true).unwrap().unwrap();
        assert_eq!(seg_a.as_ptr(), seg_b.as_ptr(), "{kind}");
        assert_eq!(seg_a.len(), SEGMENT);

        seg_a.write_u32(0, 0x1234_5678).unwrap();
        b.shm_barrier();
        assert_eq!(seg_b.read_u32(0).unwrap(), 0x1234_5678);
        assert_eq!(vfs.shm_registry().region_count(), 1);
        drop((seg_a, seg_b));

        a.shm_unmap(false).unwrap();
        b.shm_unmap(true).unwrap();
        assert_eq!(vfs.shm_registry().region_count(), 0);
        assert!(!shm_path(&fs::canonicalize(&path).unwrap()).exists());
    }
}

#[test]
fn test_memory_database_gets_no_shm() {
    for kind in BackendKind::available() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("memory.db");
        let vfs = vfs(kind);
        let mut a = open(&vfs, &path, main_db() | OpenFlags::MEMORY);

        let err = a.shm_map(0, SEGMENT, true).unwrap_err();
        assert_eq!(err.io_kind(), Some(IoErrKind::ShmMap));
        assert!(!shm_path(&path).exists());
        assert!(vfs.shm_registry().attach(&path, main_db() | OpenFlags::MEMORY).unwrap().is_none());
    }
}

#[test]
fn test_disabled_shm_gets_none() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("noshm.db");
    let vfs = HostVfs::with_config(VfsConfig::default().shared_memory(false));
    assert!(vfs.shm_registry().attach(&path, main_db()).unwrap().is_none());
    let mut a = open(&vfs, &path, main_db());
    assert!(a.shm_map(0, SEGMENT, true).is_err());
    assert!(!shm_path(&path).exists());
}

#[test]
fn test_region_reset_after_last_detach() {
    if !hostvfs::SUPPORTS_SHARED_MEMORY {
        return;
    }
    for kind in shm_backends() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("reset.db");
        let vfs = vfs(kind);

        {
            let mut a = open(&vfs, &path, main_db());
            let seg = a.shm_map(0, SEGMENT, true).unwrap().unwrap();
            seg.write_at(64, b"stale index").unwrap();
            a.close().unwrap();
        }
        assert_eq!(vfs.shm_registry().region_count(), 0);

        let mut b = open(&vfs, &path, main_db());
        // First one in: the old contents were discarded
        assert!(b.shm_map(0, SEGMENT, false).unwrap().is_none(), "{kind}");
        let seg = b.shm_map(0, SEGMENT, true).unwrap().unwrap();
        let mut buf = [0xffu8; 11];
        seg.read_at(64, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 11]);
    }
}

#[test]
fn test_segments_never_shrink() {
    if !hostvfs::SUPPORTS_SHARED_MEMORY {
        return;
    }
    for kind in shm_backends() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("grow.db");
        let vfs = vfs(kind);
        let mut a = open(&vfs, &path, main_db());

        let first = a.shm_map(0, SEGMENT, true).unwrap().unwrap();
        let third = a.shm_map(2, SEGMENT, true).unwrap().unwrap();
        assert_ne!(first.as_ptr(), third.as_ptr());

        let again = a.shm_map(0, SEGMENT, false).unwrap().unwrap();
        assert_eq!(again.as_ptr(), first.as_ptr(), "{kind}");
        assert_eq!(again.len(), SEGMENT);
        assert!(a.shm_map(1, SEGMENT, false).unwrap().is_some());

        let shm = shm_path(&fs::canonicalize(&path).unwrap());
        assert_eq!(fs::metadata(shm).unwrap().len(), 3 * SEGMENT as u64);
    }
}

// Windows refuses to truncate a file with mapped views
#[cfg(unix)]
#[test]
fn test_truncated_shm_file_is_stale() {
    if !hostvfs::SUPPORTS_SHARED_MEMORY {
        return;
    }
    for kind in shm_backends() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stale.db");
        let vfs = vfs(kind);
        let mut a = open(&vfs, &path, main_db());
        a.shm_map(0, SEGMENT, true).unwrap().unwrap();

        let shm = shm_path(&fs::canonicalize(&path).unwrap());
        OpenOptions::new().write(true).open(&shm).unwrap().set_len(0).unwrap();

        let err = a.shm_map(0, SEGMENT, true).unwrap_err();
        assert_eq!(err.io_kind(), Some(IoErrKind::ShmSize), "{kind}");
    }
}

#[cfg(unix)]
#[test]
fn test_deleted_shm_file_is_stale() {
    if !hostvfs::SUPPORTS_SHARED_MEMORY {
        return;
    }
    for kind in shm_backends() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("deleted.db");
        let vfs = vfs(kind);
        let mut a = open(&vfs, &path, main_db());
        a.shm_map(0, SEGMENT, true).unwrap().unwrap();

        fs::remove_file(shm_path(&fs::canonicalize(&path).unwrap())).unwrap();
        let err = a.shm_map(0, SEGMENT, true).unwrap_err();
        assert_eq!(err.io_kind(), Some(IoErrKind::ShmOpen), "{kind}");
    }
}

#[test]
fn test_read_only_cannot_create_index() {
    if !hostvfs::SUPPORTS_SHARED_MEMORY {
        return;
    }
    for kind in shm_backends() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("readonly.db");
        fs::write(&path, b"").unwrap();
        let vfs = vfs(kind);
        let mut a = open(&vfs, &path, OpenFlags::READONLY | OpenFlags::MAIN_DB);

        let err = a.shm_map(0, SEGMENT, true).unwrap_err();
        assert_eq!(err.code, ErrorCode::ReadOnly);
        assert_eq!(err.extended_code(), READONLY_CANTINIT);
    }
}

#[test]
fn test_slot_locks_between_handles() {
    if !hostvfs::SUPPORTS_SHARED_MEMORY {
        return;
    }
    for kind in shm_backends() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("slots.db");
        let vfs = vfs(kind);
        let mut a = open(&vfs, &path, main_db());
        let mut b = open(&vfs, &path, main_db());
        a.shm_map(0, SEGMENT, true).unwrap();
        b.shm_map(0, SEGMENT, true).unwrap();

        let exclusive = ShmLockFlags::LOCK | ShmLockFlags::EXCLUSIVE;
        let shared = ShmLockFlags::LOCK | ShmLockFlags::SHARED;

        a.shm_lock(0, 1, exclusive).unwrap();
        assert_eq!(b.shm_lock(0, 1, exclusive).unwrap_err().code, ErrorCode::Busy);
        assert_eq!(b.shm_lock(0, 1, shared).unwrap_err().code, ErrorCode::Busy);
        b.shm_lock(3, 1, shared).unwrap();
        a.shm_lock(3, 1, shared).unwrap();

        // Closing a releases its slots
        a.close().unwrap();
        b.shm_lock(0, 1, exclusive).unwrap();
        assert_eq!(b.shm_lock(0, 9, shared).unwrap_err().code, ErrorCode::Misuse);
    }
}

#[test]
fn test_writer_after_read_only_attacher() {
    if !hostvfs::SUPPORTS_SHARED_MEMORY {
        return;
    }
    for kind in shm_backends() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mixed.db");
        let vfs = vfs(kind);
        {
            let mut writer = open(&vfs, &path, main_db());
            writer.shm_map(0, SEGMENT, true).unwrap().unwrap();
            writer.close().unwrap();
        }

        let mut reader = open(&vfs, &path, OpenFlags::READONLY | OpenFlags::MAIN_DB);
        let mut writer = open(&vfs, &path, main_db());
        reader.shm_map(0, SEGMENT, false).unwrap();

        let seg = writer.shm_map(0, SEGMENT, true).unwrap().unwrap();
        seg.write_u32(0, 42).unwrap();
        let grown = writer.shm_map(1, SEGMENT, true).unwrap().unwrap();
        grown.write_u32(4, 43).unwrap();

        let seen = reader.shm_map(1, SEGMENT, false).unwrap().unwrap();
        assert_eq!(seen.read_u32(4).unwrap(), 43, "{kind}");
        assert_eq!(seen.write_u32(4, 0).unwrap_err().code, ErrorCode::ReadOnly);
    }
}

#[test]
fn test_concurrent_attach_detach() {
    if !hostvfs::SUPPORTS_SHARED_MEMORY {
        return;
    }
    for kind in shm_backends() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("threads.db");
        let vfs = vfs(kind);

        thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for _ in 0..100 {
                        let mut file = open(&vfs, &path, main_db());
                        let seg = file.shm_map(0, SEGMENT, true).unwrap().unwrap();
                        seg.read_u32(0).unwrap();
                        drop(seg);
                        file.close().unwrap();
                    }
                });
            }
        });
        assert_eq!(vfs.shm_registry().region_count(), 0, "{kind}");
    }
}
