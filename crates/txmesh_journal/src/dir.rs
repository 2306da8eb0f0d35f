//! Journal directory management.
//!
//! ```text
//! <journal_dir>/
//! ├─ LOCK                 # Advisory lock, one node process per directory
//! ├─ <resource>.journal   # One journal per resource manager
//! └─ ...
//! ```

use crate::error::{JournalError, JournalResult};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "LOCK";
const WRITE_CHECK_FILE: &str = ".write-check";
const JOURNAL_EXT: &str = "journal";

/// A node's journal directory.
///
/// When opened with [`JournalDir::open`] the directory is held under an
/// exclusive advisory lock until the value is dropped.
#[derive(Debug)]
pub struct JournalDir {
    path: PathBuf,
    _lock_file: Option<File>,
}

impl JournalDir {
    /// Opens (or creates) a journal directory and takes the lock.
    ///
    /// # Errors
    ///
    /// - [`JournalError::Directory`] if the path is missing and
    ///   `create_if_missing` is false, is not a directory, or is not writable
    /// - [`JournalError::Locked`] if another process holds the directory
    pub fn open(path: &Path, create_if_missing: bool) -> JournalResult<Self> {
        if !path.exists() {
            if create_if_missing {
                fs::create_dir_all(path).map_err(|e| {
                    JournalError::Directory(format!("cannot create {}: {e}", path.display()))
                })?;
            } else {
                return Err(JournalError::Directory(format!(
                    "{} does not exist",
                    path.display()
                )));
            }
        }

        if !path.is_dir() {
            return Err(JournalError::Directory(format!(
                "{} is not a directory",
                path.display()
            )));
        }

        let marker = path.join(WRITE_CHECK_FILE);
        File::create(&marker)
            .and_then(|_| fs::remove_file(&marker))
            .map_err(|e| {
                JournalError::Directory(format!("{} is not writable: {e}", path.display()))
            })?;

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;

        if lock_file.try_lock_exclusive().is_err() {
            return Err(JournalError::Locked(path.display().to_string()));
        }

        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: Some(lock_file),
        })
    }

    /// Opens an existing directory for inspection, without locking it.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError::Directory`] if the path is not a directory.
    pub fn open_read_only(path: &Path) -> JournalResult<Self> {
        if !path.is_dir() {
            return Err(JournalError::Directory(format!(
                "{} is not a directory",
                path.display()
            )));
        }
        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: None,
        })
    }

    /// Returns the directory path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the journal file path of a resource manager.
    ///
    /// Characters outside `[A-Za-z0-9_-]` are replaced with `_`.
    #[must_use]
    pub fn journal_path(&self, resource: &str) -> PathBuf {
        let name: String = resource
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '_' | '-') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.path.join(format!("{name}.{JOURNAL_EXT}"))
    }

    /// Lists the journal files in the directory, sorted by name.
    ///
    /// Returns `(file stem, path)` pairs.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be read.
    pub fn journals(&self) -> JournalResult<Vec<(String, PathBuf)>> {
        let mut found = Vec::new();
        for entry in fs::read_dir(&self.path)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(JOURNAL_EXT) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                found.push((stem.to_string(), path.clone()));
            }
        }
        found.sort();
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn creates_missing_directory() {
        let root = tempdir().unwrap();
        let path = root.path().join("node-a");

        let dir = JournalDir::open(&path, true).unwrap();
        assert!(path.is_dir());
        assert!(path.join(LOCK_FILE).exists());
        assert!(!path.join(WRITE_CHECK_FILE).exists());
        assert_eq!(dir.path(), path.as_path());
    }

    #[test]
    fn missing_directory_without_create() {
        let root = tempdir().unwrap();
        let err = JournalDir::open(&root.path().join("nope"), false).unwrap_err();
        assert!(matches!(err, JournalError::Directory(_)));
    }

    #[test]
    fn file_is_not_a_directory() {
        let root = tempdir().unwrap();
        let file = root.path().join("plain");
        fs::write(&file, b"x").unwrap();

        let err = JournalDir::open(&file, true).unwrap_err();
        assert!(matches!(err, JournalError::Directory(_)));
    }

    #[test]
    fn second_open_is_locked() {
        let root = tempdir().unwrap();
        let _first = JournalDir::open(root.path(), true).unwrap();

        let err = JournalDir::open(root.path(), true).unwrap_err();
        assert!(matches!(err, JournalError::Locked(_)));

        // Inspection does not need the lock
        assert!(JournalDir::open_read_only(root.path()).is_ok());
    }

    #[test]
    fn journal_paths_are_sanitized() {
        let root = tempdir().unwrap();
        let dir = JournalDir::open(root.path(), true).unwrap();

        assert_eq!(
            dir.journal_path("blocks"),
            root.path().join("blocks.journal")
        );
        assert_eq!(
            dir.journal_path("../evil/x"),
            root.path().join("___evil_x.journal")
        );
    }

    #[test]
    fn lists_journals() {
        let root = tempdir().unwrap();
        let dir = JournalDir::open(root.path(), true).unwrap();
        fs::write(dir.journal_path("meta"), b"").unwrap();
        fs::write(dir.journal_path("blocks"), b"").unwrap();

        let names: Vec<String> = dir.journals().unwrap().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["blocks".to_string(), "meta".to_string()]);
    }
}
