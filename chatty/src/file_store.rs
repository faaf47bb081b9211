// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The on-disk upload directory: save, read-via-map, purge-all, all three
//! holding the store's single mutex for their entire duration. Callers
//! must not nest a file-store call under any registry lock -- the
//! file-store mutex is the outermost lock in this crate's ordering.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use memmap2::Mmap;

use crate::error::ServerError;

pub struct FileStore {
    dir: PathBuf,
    /// Serialises every save/load/purge; held for the whole operation, not
    /// just the directory lookup.
    lock: Mutex<()>,
}

impl FileStore {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            lock: Mutex::new(()),
        }
    }

    /// Creates or truncates `dir/name` and writes `bytes` in full, fsyncing
    /// before close so the file is durable before the caller's OK reply
    /// goes out.
    pub fn save(&self, name: &str, bytes: &[u8]) -> Result<(), ServerError> {
        let _guard = self.lock.lock().unwrap();
        let path = self.dir.join(name);
        let mut file = File::create(&path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        Ok(())
    }

    /// Opens `dir/name` read-only and returns a read-only memory mapping of
    /// the whole file. `NotFound` if the file does not `stat`.
    pub fn load(&self, name: &str) -> Result<Mmap, ServerError> {
        let _guard = self.lock.lock().unwrap();
        let path = self.dir.join(name);
        let file = File::open(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ServerError::NoSuchFile
            } else {
                ServerError::Io(e)
            }
        })?;
        // SAFETY: the file store holds `lock` for the mapping's entire
        // borrowed lifetime (callers release it before returning the
        // descriptor to the listener), so no writer can truncate the
        // backing file while it is mapped.
        unsafe { Mmap::map(&file) }.map_err(ServerError::Io)
    }

    /// Unlinks every entry in the directory except `.` and `..`.
    pub fn purge(&self) -> Result<(), ServerError> {
        let _guard = self.lock.lock().unwrap();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                std::fs::remove_dir_all(entry.path())?;
            } else {
                std::fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }
}

/// Strips any directory components from a POSTFILE payload path, leaving
/// only the basename under which the file is stored. Rejects empty or
/// `.`/`..`-only names as a bad argument.
pub fn basename(path: &str) -> Result<String, ServerError> {
    let name = Path::new(path)
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| ServerError::BadArg(format!("no valid file name in {path:?}")))?;
    if name.is_empty() || name == "." || name == ".." {
        return Err(ServerError::BadArg(format!("invalid file name {path:?}")));
    }
    Ok(name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("chatty-filestore-test-{}-{:?}", std::process::id(), std::thread::current().id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn save_then_load_round_trips_bytes() {
        let dir = scratch_dir();
        let store = FileStore::new(dir.clone());
        store.save("notes.txt", b"hello world").unwrap();
        let mapping = store.load("notes.txt").unwrap();
        assert_eq!(&mapping[..], b"hello world");
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn load_missing_file_is_no_such_file() {
        let dir = scratch_dir();
        let store = FileStore::new(dir.clone());
        assert!(matches!(store.load("missing.txt"), Err(ServerError::NoSuchFile)));
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn purge_removes_every_entry() {
        let dir = scratch_dir();
        let store = FileStore::new(dir.clone());
        store.save("a.txt", b"a").unwrap();
        store.save("b.txt", b"b").unwrap();
        store.purge().unwrap();
        let remaining: Vec<_> = std::fs::read_dir(&dir).unwrap().collect();
        assert!(remaining.is_empty());
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn basename_strips_directory_components() {
        assert_eq!(basename("./notes.txt").unwrap(), "notes.txt");
        assert_eq!(basename("a/b/c.bin").unwrap(), "c.bin");
        assert!(basename("").is_err());
        assert!(basename("..").is_err());
    }

    #[test]
    fn overwrite_truncates_previous_contents() {
        let dir = scratch_dir();
        let store = FileStore::new(dir.clone());
        store.save("f.txt", b"a long first write").unwrap();
        store.save("f.txt", b"short").unwrap();
        let mapping = store.load("f.txt").unwrap();
        assert_eq!(&mapping[..], b"short");
        std::fs::remove_dir_all(dir).unwrap();
    }
}
