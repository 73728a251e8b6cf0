//! SFTP handle table.
//!
//! Handles are opaque random byte strings (default 16 bytes) naming a
//! live file or directory. Generation retries a bounded number of rounds
//! on collision; the table enforces the per-session open-handle cap.
//! Every request referencing a handle must validate its kind first.

use keel_platform::{KeelError, KeelResult};
use rand::RngCore;
use std::collections::HashMap;
use std::fs::File;
use std::path::PathBuf;

/// A held byte-range lock (offset, length, lock mask).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRangeLock {
    /// Start offset.
    pub offset: u64,
    /// Length in bytes (0 = to EOF).
    pub length: u64,
    /// ACE4 mask the lock was taken with.
    pub mask: u32,
}

/// State for an open file handle.
#[derive(Debug)]
pub struct FileHandle {
    /// Open file.
    pub file: File,
    /// Resolved path the handle was opened on.
    pub path: PathBuf,
    /// ACE4 access mask granted at open.
    pub access: u32,
    /// Whether writes must append.
    pub append: bool,
    /// Advisory byte-range locks held through this handle.
    pub locks: Vec<ByteRangeLock>,
}

impl FileHandle {
    /// Takes a byte-range lock.
    pub fn lock(&mut self, offset: u64, length: u64, mask: u32) {
        self.locks.push(ByteRangeLock {
            offset,
            length,
            mask,
        });
    }

    /// Releases the lock matching (offset, length). Returns false when
    /// nothing matches.
    pub fn unlock(&mut self, offset: u64, length: u64) -> bool {
        let before = self.locks.len();
        self.locks
            .retain(|l| !(l.offset == offset && l.length == length));
        self.locks.len() != before
    }
}

/// State for an open directory handle.
#[derive(Debug)]
pub struct DirHandle {
    /// Directory path.
    pub path: PathBuf,
    /// Remaining real entries, resolved at open.
    pub entries: Vec<PathBuf>,
    /// Read cursor into `entries`.
    pub position: usize,
    /// "." not yet sent.
    pub send_dot: bool,
    /// ".." not yet sent.
    pub send_dotdot: bool,
    /// Fully drained; the next READDIR answers EOF.
    pub done: bool,
}

impl DirHandle {
    /// Creates a directory handle that synthesizes "." and ".." before
    /// the real entries.
    pub fn new(path: PathBuf, entries: Vec<PathBuf>) -> Self {
        Self {
            path,
            entries,
            position: 0,
            send_dot: true,
            send_dotdot: true,
            done: false,
        }
    }

    /// Whether anything remains to send.
    pub fn has_pending(&self) -> bool {
        self.send_dot || self.send_dotdot || self.position < self.entries.len()
    }
}

/// An open handle: file or directory.
#[derive(Debug)]
pub enum Handle {
    /// File handle.
    File(FileHandle),
    /// Directory handle.
    Dir(DirHandle),
}

impl Handle {
    /// Validates this handle as a file handle.
    pub fn as_file(&mut self) -> KeelResult<&mut FileHandle> {
        match self {
            Handle::File(f) => Ok(f),
            Handle::Dir(_) => Err(KeelError::Channel(
                "Handle is a directory, not a file".to_string(),
            )),
        }
    }

    /// Validates this handle as a directory handle.
    pub fn as_dir(&mut self) -> KeelResult<&mut DirHandle> {
        match self {
            Handle::Dir(d) => Ok(d),
            Handle::File(_) => Err(KeelError::Channel(
                "Handle is a file, not a directory".to_string(),
            )),
        }
    }
}

/// Table of open handles for one subsystem instance.
///
/// Accessed only from the subsystem worker task, so no internal locking.
#[derive(Debug)]
pub struct HandleTable {
    handles: HashMap<Vec<u8>, Handle>,
    handle_size: usize,
    max_rounds: usize,
    max_open: usize,
}

impl HandleTable {
    /// Creates a table.
    ///
    /// `handle_size` is clamped to 4..=64 bytes; `max_open` of 0 means
    /// unlimited.
    pub fn new(handle_size: usize, max_rounds: usize, max_open: usize) -> Self {
        Self {
            handles: HashMap::new(),
            handle_size: handle_size.clamp(4, 64),
            max_rounds: max_rounds.max(1),
            max_open,
        }
    }

    /// Number of live handles.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Inserts a handle under a fresh random id and returns the id.
    ///
    /// # Errors
    ///
    /// [`KeelError::Resource`] when the per-session cap is reached or no
    /// unique id was found within the retry budget.
    pub fn insert(&mut self, handle: Handle) -> KeelResult<Vec<u8>> {
        if self.max_open != 0 && self.handles.len() >= self.max_open {
            return Err(KeelError::Resource(format!(
                "Too many open handles: {} (maximum {})",
                self.handles.len(),
                self.max_open
            )));
        }

        for _ in 0..self.max_rounds {
            let mut id = vec![0u8; self.handle_size];
            rand::thread_rng().fill_bytes(&mut id);
            if self.handles.contains_key(&id) {
                continue;
            }
            self.handles.insert(id.clone(), handle);
            return Ok(id);
        }

        Err(KeelError::Resource(format!(
            "Failed to generate a unique handle within {} rounds",
            self.max_rounds
        )))
    }

    /// Looks up a handle.
    pub fn get(&mut self, id: &[u8]) -> KeelResult<&mut Handle> {
        self.handles
            .get_mut(id)
            .ok_or_else(|| KeelError::Channel("No such handle".to_string()))
    }

    /// Removes a handle, returning it for resource cleanup.
    pub fn remove(&mut self, id: &[u8]) -> KeelResult<Handle> {
        self.handles
            .remove(id)
            .ok_or_else(|| KeelError::Channel("No such handle".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dir_handle() -> Handle {
        Handle::Dir(DirHandle::new(PathBuf::from("/tmp"), Vec::new()))
    }

    fn file_handle(dir: &tempfile::TempDir) -> Handle {
        let path = dir.path().join("f");
        std::fs::write(&path, b"x").unwrap();
        Handle::File(FileHandle {
            file: File::open(&path).unwrap(),
            path,
            access: 0,
            append: false,
            locks: Vec::new(),
        })
    }

    #[test]
    fn test_insert_and_lookup() {
        let mut table = HandleTable::new(16, 8, 0);
        let id = table.insert(dir_handle()).unwrap();
        assert_eq!(id.len(), 16);
        assert!(table.get(&id).is_ok());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_handle_ids_unique() {
        let mut table = HandleTable::new(16, 8, 0);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..64 {
            let id = table.insert(dir_handle()).unwrap();
            assert!(seen.insert(id));
        }
    }

    #[test]
    fn test_handle_size_clamped() {
        let mut table = HandleTable::new(1, 8, 0);
        let id = table.insert(dir_handle()).unwrap();
        assert_eq!(id.len(), 4);

        let mut table = HandleTable::new(1000, 8, 0);
        let id = table.insert(dir_handle()).unwrap();
        assert_eq!(id.len(), 64);
    }

    #[test]
    fn test_open_handle_cap() {
        let mut table = HandleTable::new(16, 8, 2);
        table.insert(dir_handle()).unwrap();
        table.insert(dir_handle()).unwrap();
        let err = table.insert(dir_handle()).unwrap_err();
        assert!(matches!(err, KeelError::Resource(_)));
    }

    #[test]
    fn test_remove_frees_slot() {
        let mut table = HandleTable::new(16, 8, 1);
        let id = table.insert(dir_handle()).unwrap();
        table.remove(&id).unwrap();
        assert!(table.is_empty());
        assert!(table.insert(dir_handle()).is_ok());
        assert!(table.remove(&id).is_err());
    }

    #[test]
    fn test_kind_validation() {
        let dir = tempfile::tempdir().unwrap();
        let mut table = HandleTable::new(16, 8, 0);
        let file_id = table.insert(file_handle(&dir)).unwrap();
        let dir_id = table.insert(dir_handle()).unwrap();

        assert!(table.get(&file_id).unwrap().as_file().is_ok());
        assert!(table.get(&file_id).unwrap().as_dir().is_err());
        assert!(table.get(&dir_id).unwrap().as_dir().is_ok());
        assert!(table.get(&dir_id).unwrap().as_file().is_err());
    }

    #[test]
    fn test_byte_range_locks() {
        let dir = tempfile::tempdir().unwrap();
        let mut handle = file_handle(&dir);
        let file = handle.as_file().unwrap();

        file.lock(0, 100, 1);
        file.lock(200, 50, 2);
        assert_eq!(file.locks.len(), 2);

        assert!(file.unlock(0, 100));
        assert!(!file.unlock(0, 100));
        assert!(!file.unlock(999, 1));
        assert_eq!(file.locks.len(), 1);
    }

    #[test]
    fn test_dir_handle_dot_entries() {
        let mut dh = DirHandle::new(PathBuf::from("/x"), vec![PathBuf::from("/x/a")]);
        assert!(dh.has_pending());
        dh.send_dot = false;
        dh.send_dotdot = false;
        assert!(dh.has_pending());
        dh.position = 1;
        assert!(!dh.has_pending());
    }
}
