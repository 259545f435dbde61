//! A filesystem-backed lock preventing two processes from operating on the
//! same node data directory at once. Mirrors `core`'s directory-lock idiom:
//! an exclusive `flock` held on a sentinel file for the lifetime of the
//! returned guard.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use fs2::FileExt;

/// Holds an exclusive advisory lock on `<dir>/.lock` until dropped.
pub struct DirLock {
    dir: PathBuf,
    file: File,
}

impl DirLock {
    /// Opens (creating if necessary) `dir` and takes an exclusive,
    /// non-blocking lock on a sentinel file inside it.
    ///
    /// Fails if another live process already holds the lock, which is the
    /// signal we want: two server processes must never share a data
    /// directory.
    pub fn open(dir: &Path) -> io::Result<Self> {
        std::fs::create_dir_all(dir)?;

        let lock_path = dir.join(".lock");
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&lock_path)?;

        file.try_lock_exclusive().map_err(|_| {
            io::Error::new(
                io::ErrorKind::WouldBlock,
                format!("data directory {} is locked by another process", dir.display()),
            )
        })?;

        Ok(DirLock {
            dir: dir.to_owned(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_lock_on_same_dir_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let first = DirLock::open(tmp.path()).unwrap();
        let second = DirLock::open(tmp.path());
        assert!(second.is_err());
        drop(first);
        // Once released, a new lock can be acquired.
        let third = DirLock::open(tmp.path());
        assert!(third.is_ok());
    }
}
