//! In-memory mock filesystem.
//!
//! `MockFs` simulates `/proc`, cgroupfs, and `/etc` in memory. Clones share
//! the same backing store, so a test can hand clones to the collector and
//! the enforcer and still observe every write through the original handle.
//! All writes are recorded in order, which is what lets enforcement tests
//! assert byte-for-byte idempotence.

use crate::collector::traits::FileSystem;
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

#[derive(Debug, Default)]
struct Inner {
    /// Map from path to file contents.
    files: HashMap<PathBuf, String>,
    /// Set of directories (for read_dir support).
    directories: HashSet<PathBuf>,
    /// Every write performed through the `FileSystem` trait, in order.
    write_log: Vec<(PathBuf, String)>,
}

/// In-memory filesystem for testing. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MockFs {
    inner: Arc<RwLock<Inner>>,
}

impl MockFs {
    /// Creates a new empty mock filesystem.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a file with the given content. Parent directories are created.
    pub fn add_file(&self, path: impl AsRef<Path>, content: impl Into<String>) {
        let path = path.as_ref().to_path_buf();
        let mut inner = self.inner.write().unwrap();
        add_parents(&mut inner.directories, &path);
        inner.files.insert(path, content.into());
    }

    /// Adds an empty directory (and its parents).
    pub fn add_dir(&self, path: impl AsRef<Path>) {
        let path = path.as_ref().to_path_buf();
        let mut inner = self.inner.write().unwrap();
        add_parents(&mut inner.directories, &path);
        inner.directories.insert(path);
    }

    /// Removes a single file.
    pub fn remove_file(&self, path: impl AsRef<Path>) {
        self.inner
            .write()
            .unwrap()
            .files
            .remove(path.as_ref());
    }

    /// Removes a directory and everything beneath it. Simulates a user
    /// slice disappearing when the last session ends.
    pub fn remove_tree(&self, path: impl AsRef<Path>) {
        let prefix = path.as_ref().to_path_buf();
        let mut inner = self.inner.write().unwrap();
        inner.files.retain(|p, _| !p.starts_with(&prefix));
        inner.directories.retain(|p| !p.starts_with(&prefix));
    }

    /// Returns the contents of a file, if present.
    pub fn contents(&self, path: impl AsRef<Path>) -> Option<String> {
        self.inner.read().unwrap().files.get(path.as_ref()).cloned()
    }

    /// Returns all writes performed so far, in order.
    pub fn write_log(&self) -> Vec<(PathBuf, String)> {
        self.inner.read().unwrap().write_log.clone()
    }

    /// Forgets recorded writes without touching file contents.
    pub fn clear_write_log(&self) {
        self.inner.write().unwrap().write_log.clear();
    }
}

fn add_parents(directories: &mut HashSet<PathBuf>, path: &Path) {
    let mut parent = path.parent();
    while let Some(p) = parent {
        if !p.as_os_str().is_empty() {
            directories.insert(p.to_path_buf());
        }
        parent = p.parent();
    }
}

impl FileSystem for MockFs {
    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        self.inner
            .read()
            .unwrap()
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("{}", path.display())))
    }

    fn write(&self, path: &Path, contents: &str) -> io::Result<()> {
        let mut inner = self.inner.write().unwrap();
        let parent_exists = path
            .parent()
            .map(|p| inner.directories.contains(p))
            .unwrap_or(false);
        if !inner.files.contains_key(path) && !parent_exists {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{}", path.display()),
            ));
        }
        inner.files.insert(path.to_path_buf(), contents.to_string());
        inner
            .write_log
            .push((path.to_path_buf(), contents.to_string()));
        Ok(())
    }

    fn exists(&self, path: &Path) -> bool {
        let inner = self.inner.read().unwrap();
        inner.files.contains_key(path) || inner.directories.contains(path)
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        let inner = self.inner.read().unwrap();
        if !inner.directories.contains(path) {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{}", path.display()),
            ));
        }
        let mut entries: Vec<PathBuf> = inner
            .files
            .keys()
            .chain(inner.directories.iter())
            .filter(|p| p.parent() == Some(path))
            .cloned()
            .collect();
        entries.sort();
        entries.dedup();
        Ok(entries)
    }
}
