//! Cross-process writer exclusion.
//!
//! An index file has exactly one writer: the pager replays and resets the
//! log on open, so a second process opening the same file would rewrite
//! pages and truncate a log that the first process is still appending to.
//! The writer holds an advisory exclusive lock on `<path>-lock` for as long
//! as its pager lives.

use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::{debug, warn};

use crate::types::{IndexError, Result};

/// Path of the lock file guarding the index at `path`.
pub fn lock_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(OsString::from)
        .unwrap_or_else(|| OsString::from("refindex"));
    name.push("-lock");
    let mut out = path.to_path_buf();
    out.set_file_name(name);
    out
}

/// Exclusive writer lock on an index file. Released on drop.
#[derive(Debug)]
pub struct SingleWriter {
    file: File,
    path: PathBuf,
}

impl SingleWriter {
    /// Takes the writer lock for the index at `path` without blocking.
    ///
    /// # Errors
    ///
    /// * `IndexError::Unavailable` - another writer holds the lock
    /// * `IndexError::Io` - the lock file cannot be created or locked
    pub fn acquire(path: &Path) -> Result<Self> {
        let path = lock_path(path);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        match file.try_lock_exclusive() {
            Ok(()) => {
                debug!(lock = %path.display(), "pager.lock.acquired");
                Ok(Self { file, path })
            }
            Err(err) if is_contended(&err) => {
                debug!(lock = %path.display(), "pager.lock.contended");
                Err(IndexError::Unavailable("index is locked by another writer"))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// The lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SingleWriter {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            warn!(lock = %self.path.display(), error = %err, "pager.lock.release_failed");
        }
    }
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FailureClass;

    #[test]
    fn second_writer_is_turned_away_until_the_first_drops() {
        let dir = tempfile::tempdir().unwrap();
        let index = dir.path().join("x.idx");
        let first = SingleWriter::acquire(&index).unwrap();
        assert_eq!(first.path(), dir.path().join("x.idx-lock"));

        let err = SingleWriter::acquire(&index).unwrap_err();
        assert_eq!(err.class(), FailureClass::Transient);

        drop(first);
        SingleWriter::acquire(&index).unwrap();
    }

    #[test]
    fn separate_indexes_lock_independently() {
        let dir = tempfile::tempdir().unwrap();
        let _a = SingleWriter::acquire(&dir.path().join("a.idx")).unwrap();
        let _b = SingleWriter::acquire(&dir.path().join("b.idx")).unwrap();
    }
}
