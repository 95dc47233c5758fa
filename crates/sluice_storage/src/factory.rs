//! Named-file factories.
//!
//! A factory owns one directory worth of files. The journal keeps its
//! segments in one factory and every paging store keeps its pages in
//! another, so neither needs to know whether the bytes live on disk or
//! in memory.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use crate::file::FileBackend;
use crate::memory::InMemoryBackend;
use fs2::FileExt;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Name of the advisory lock file held by a locked [`DirectoryFactory`].
pub const LOCK_FILE: &str = "LOCK";

const TEMP_SUFFIX: &str = ".tmp";

/// Hands out storage backends by file name.
///
/// Names are flat: they must be non-empty and may not contain a path
/// separator. All implementations must be safe to share between threads.
pub trait FileFactory: Send + Sync + fmt::Debug {
    /// Opens the named file, creating it empty when it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is invalid or the file cannot be opened.
    fn open(&self, name: &str) -> StorageResult<Box<dyn StorageBackend>>;

    /// Lists the names of all files ending in `.<extension>`, sorted.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be read.
    fn list(&self, extension: &str) -> StorageResult<Vec<String>>;

    /// Returns whether the named file exists.
    fn exists(&self, name: &str) -> bool;

    /// Deletes the named file.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] if the file does not exist.
    fn delete(&self, name: &str) -> StorageResult<()>;

    /// Renames a file, replacing any existing file named `to`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] if `from` does not exist.
    fn rename(&self, from: &str, to: &str) -> StorageResult<()>;

    /// Reads a whole file.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] if the file does not exist.
    fn read_all(&self, name: &str) -> StorageResult<Vec<u8>>;

    /// Replaces a file's contents atomically (write temp, sync, rename).
    ///
    /// # Errors
    ///
    /// Returns an error if any step fails; the previous contents survive.
    fn write_atomic(&self, name: &str, data: &[u8]) -> StorageResult<()>;

    /// Makes preceding creates, renames and deletes durable.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be synced.
    fn sync_dir(&self) -> StorageResult<()>;
}

fn validate_name(name: &str) -> StorageResult<()> {
    if name.is_empty() || name.contains('/') || name.contains('\\') || name == "." || name == ".."
    {
        return Err(StorageError::InvalidName(name.to_string()));
    }
    Ok(())
}

fn has_extension(name: &str, extension: &str) -> bool {
    name.strip_suffix(extension)
        .is_some_and(|stem| stem.ends_with('.') && stem.len() > 1)
}

/// A factory backed by a directory on disk.
///
/// When opened with [`DirectoryFactory::open`] the factory holds an
/// exclusive advisory lock on `<root>/LOCK` for its lifetime, so a second
/// process cannot open the same journal.
pub struct DirectoryFactory {
    root: PathBuf,
    lock_file: Option<File>,
}

impl DirectoryFactory {
    /// Opens or creates the directory and takes its exclusive lock.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Locked`] if another holder owns the lock.
    pub fn open(root: &Path) -> StorageResult<Self> {
        fs::create_dir_all(root)?;

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(root.join(LOCK_FILE))?;

        if lock_file.try_lock_exclusive().is_err() {
            return Err(StorageError::Locked(root.display().to_string()));
        }

        tracing::debug!(root = %root.display(), "directory locked");
        Ok(Self {
            root: root.to_path_buf(),
            lock_file: Some(lock_file),
        })
    }

    /// Opens or creates the directory without taking the lock.
    ///
    /// Used for per-address page directories, which are covered by the
    /// paging root's lock, and by offline inspection tools.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn open_unlocked(root: &Path) -> StorageResult<Self> {
        fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
            lock_file: None,
        })
    }

    /// Returns the directory this factory manages.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the full path of a named file.
    #[must_use]
    pub fn path_of(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn not_found(&self, name: &str) -> StorageError {
        StorageError::NotFound(self.path_of(name).display().to_string())
    }
}

impl fmt::Debug for DirectoryFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectoryFactory")
            .field("root", &self.root)
            .field("locked", &self.lock_file.is_some())
            .finish()
    }
}

impl Drop for DirectoryFactory {
    fn drop(&mut self) {
        if let Some(lock_file) = self.lock_file.take() {
            let _ = FileExt::unlock(&lock_file);
        }
    }
}

impl FileFactory for DirectoryFactory {
    fn open(&self, name: &str) -> StorageResult<Box<dyn StorageBackend>> {
        validate_name(name)?;
        Ok(Box::new(FileBackend::open(&self.path_of(name))?))
    }

    fn list(&self, extension: &str) -> StorageResult<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if has_extension(name, extension) {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    fn exists(&self, name: &str) -> bool {
        validate_name(name).is_ok() && self.path_of(name).is_file()
    }

    fn delete(&self, name: &str) -> StorageResult<()> {
        validate_name(name)?;
        let path = self.path_of(name);
        if !path.exists() {
            return Err(self.not_found(name));
        }
        fs::remove_file(path)?;
        Ok(())
    }

    fn rename(&self, from: &str, to: &str) -> StorageResult<()> {
        validate_name(from)?;
        validate_name(to)?;
        let source = self.path_of(from);
        if !source.exists() {
            return Err(self.not_found(from));
        }
        fs::rename(source, self.path_of(to))?;
        Ok(())
    }

    fn read_all(&self, name: &str) -> StorageResult<Vec<u8>> {
        validate_name(name)?;
        let path = self.path_of(name);
        if !path.exists() {
            return Err(self.not_found(name));
        }
        Ok(fs::read(path)?)
    }

    fn write_atomic(&self, name: &str, data: &[u8]) -> StorageResult<()> {
        validate_name(name)?;
        let temp_path = self.path_of(&format!("{name}{TEMP_SUFFIX}"));
        {
            let mut file = File::create(&temp_path)?;
            file.write_all(data)?;
            file.sync_all()?;
        }
        fs::rename(&temp_path, self.path_of(name))?;
        self.sync_dir()
    }

    #[cfg(unix)]
    fn sync_dir(&self) -> StorageResult<()> {
        File::open(&self.root)?.sync_all()?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn sync_dir(&self) -> StorageResult<()> {
        Ok(())
    }
}

type SharedFiles = Arc<RwLock<BTreeMap<String, Arc<RwLock<Vec<u8>>>>>>;

/// A factory whose files live in memory.
///
/// Clones share the same file table, so a test can drop a journal,
/// inspect or damage its files, and open a new journal over the same
/// factory to observe recovery.
#[derive(Debug, Default, Clone)]
pub struct InMemoryFactory {
    files: SharedFiles,
}

impl InMemoryFactory {
    /// Creates an empty factory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of a file's bytes, if it exists.
    #[must_use]
    pub fn file_data(&self, name: &str) -> Option<Vec<u8>> {
        self.files.read().get(name).map(|data| data.read().clone())
    }

    /// Replaces a file's bytes, creating the file if needed.
    pub fn set_file_data(&self, name: &str, data: Vec<u8>) {
        let mut files = self.files.write();
        match files.get(name) {
            Some(existing) => *existing.write() = data,
            None => {
                files.insert(name.to_string(), Arc::new(RwLock::new(data)));
            }
        }
    }

    /// Returns the names of every file in the factory.
    #[must_use]
    pub fn file_names(&self) -> Vec<String> {
        self.files.read().keys().cloned().collect()
    }
}

impl FileFactory for InMemoryFactory {
    fn open(&self, name: &str) -> StorageResult<Box<dyn StorageBackend>> {
        validate_name(name)?;
        let data = Arc::clone(
            self.files
                .write()
                .entry(name.to_string())
                .or_insert_with(Arc::default),
        );
        Ok(Box::new(InMemoryBackend::shared(data)))
    }

    fn list(&self, extension: &str) -> StorageResult<Vec<String>> {
        Ok(self
            .files
            .read()
            .keys()
            .filter(|name| has_extension(name, extension))
            .cloned()
            .collect())
    }

    fn exists(&self, name: &str) -> bool {
        self.files.read().contains_key(name)
    }

    fn delete(&self, name: &str) -> StorageResult<()> {
        validate_name(name)?;
        self.files
            .write()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(name.to_string()))
    }

    fn rename(&self, from: &str, to: &str) -> StorageResult<()> {
        validate_name(from)?;
        validate_name(to)?;
        let mut files = self.files.write();
        let data = files
            .remove(from)
            .ok_or_else(|| StorageError::NotFound(from.to_string()))?;
        files.insert(to.to_string(), data);
        Ok(())
    }

    fn read_all(&self, name: &str) -> StorageResult<Vec<u8>> {
        self.file_data(name)
            .ok_or_else(|| StorageError::NotFound(name.to_string()))
    }

    fn write_atomic(&self, name: &str, data: &[u8]) -> StorageResult<()> {
        validate_name(name)?;
        self.files
            .write()
            .insert(name.to_string(), Arc::new(RwLock::new(data.to_vec())));
        Ok(())
    }

    fn sync_dir(&self) -> StorageResult<()> {
        Ok(())
    }
}
