use parking_lot::RwLock;
use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::os::fd::{AsFd, BorrowedFd, FromRawFd, OwnedFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// An open file: the native fd plus the virtual path it was opened under.
/// The registry owns the fd; dropping the last clone closes it.
#[derive(Debug, Clone)]
pub struct FileHandle {
    fd: Arc<OwnedFd>,
    pub path: OsString,
}

impl FileHandle {
    pub fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

/// An open directory: union readdir re-resolves branches per call, so only
/// the virtual path is kept.
#[derive(Debug, Clone)]
pub struct DirHandle {
    pub path: OsString,
}

#[derive(Debug, Clone)]
enum Handle {
    File(FileHandle),
    Dir(DirHandle),
}

/// Maps the opaque u64 the kernel stores per open file back to the entry.
/// Ids start at 1 so 0 never names a live handle.
#[derive(Debug)]
pub struct HandleTable {
    next_id: AtomicU64,
    entries: RwLock<HashMap<u64, Handle>>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn insert_file(&self, fd: OwnedFd, path: &OsStr) -> u64 {
        self.insert(Handle::File(FileHandle {
            fd: Arc::new(fd),
            path: path.to_owned(),
        }))
    }

    pub fn insert_dir(&self, path: &OsStr) -> u64 {
        self.insert(Handle::Dir(DirHandle {
            path: path.to_owned(),
        }))
    }

    pub fn get_file(&self, id: u64) -> Option<FileHandle> {
        match self.entries.read().get(&id) {
            Some(Handle::File(handle)) => Some(handle.clone()),
            _ => None,
        }
    }

    pub fn get_dir(&self, id: u64) -> Option<DirHandle> {
        match self.entries.read().get(&id) {
            Some(Handle::Dir(handle)) => Some(handle.clone()),
            _ => None,
        }
    }

    pub fn remove(&self, id: u64) {
        self.entries.write().remove(&id);
    }

    fn insert(&self, handle: Handle) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.write().insert(id, handle);
        id
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}
