//! Filesystem boundary of the coordinator.
//!
//! The protocol only needs five primitives, so tests can swap the real
//! directory tree for [`MemoryFs`] and never touch disk.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

pub trait CoordinationFs: Send + Sync + std::fmt::Debug {
    fn create_dir_all(&self, path: &Path) -> io::Result<()>;
    fn read_to_string(&self, path: &Path) -> io::Result<String>;
    /// Replace `path` so readers see either the old or the new content.
    fn write_atomic(&self, path: &Path, data: &[u8]) -> io::Result<()>;
    fn remove_file(&self, path: &Path) -> io::Result<()>;
    /// `*.json` files directly inside `dir`, sorted.
    fn list_json(&self, dir: &Path) -> io::Result<Vec<PathBuf>>;
}

fn is_json(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "json")
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RealFs;

impl CoordinationFs for RealFs {
    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        fs::create_dir_all(path)
    }

    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        fs::read_to_string(path)
    }

    fn write_atomic(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        let parent = path
            .parent()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no parent"))?;
        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        tmp.write_all(data)?;
        tmp.flush()?;
        tmp.persist(path).map_err(|err| err.error)?;
        Ok(())
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }

    fn list_json(&self, dir: &Path) -> io::Result<Vec<PathBuf>> {
        let mut paths = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_file() && is_json(&path) {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }
}

#[derive(Debug, Default)]
struct MemoryTree {
    dirs: BTreeSet<PathBuf>,
    files: BTreeMap<PathBuf, String>,
}

/// In-memory tree. Several coordinators sharing one `Arc<MemoryFs>` behave
/// like processes sharing a runtime directory.
#[derive(Debug, Default)]
pub struct MemoryFs {
    tree: Mutex<MemoryTree>,
}

impl MemoryFs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write a file directly, bypassing the directory check.
    pub fn insert(&self, path: impl Into<PathBuf>, content: impl Into<String>) {
        let path = path.into();
        let mut tree = self.tree.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(parent) = path.parent() {
            tree.dirs.insert(parent.to_path_buf());
        }
        tree.files.insert(path, content.into());
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.tree
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .files
            .contains_key(path)
    }

    pub fn file_count(&self) -> usize {
        self.tree
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .files
            .len()
    }
}

fn not_found(path: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::NotFound,
        format!("{} does not exist", path.display()),
    )
}

impl CoordinationFs for MemoryFs {
    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        let mut tree = self.tree.lock().unwrap_or_else(PoisonError::into_inner);
        for ancestor in path.ancestors() {
            tree.dirs.insert(ancestor.to_path_buf());
        }
        Ok(())
    }

    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        self.tree
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| not_found(path))
    }

    fn write_atomic(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        let content = String::from_utf8(data.to_vec())
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        let mut tree = self.tree.lock().unwrap_or_else(PoisonError::into_inner);
        let parent = path.parent().unwrap_or(Path::new(""));
        if !tree.dirs.contains(parent) {
            return Err(not_found(parent));
        }
        tree.files.insert(path.to_path_buf(), content);
        Ok(())
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        self.tree
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .files
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| not_found(path))
    }

    fn list_json(&self, dir: &Path) -> io::Result<Vec<PathBuf>> {
        let tree = self.tree.lock().unwrap_or_else(PoisonError::into_inner);
        if !tree.dirs.contains(dir) {
            return Err(not_found(dir));
        }
        Ok(tree
            .files
            .keys()
            .filter(|path| path.parent() == Some(dir) && is_json(path))
            .cloned()
            .collect())
    }
}
