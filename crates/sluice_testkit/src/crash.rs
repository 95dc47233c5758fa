//! Crash simulation.
//!
//! A [`CrashableFactory`] wraps an [`InMemoryFactory`] and shares one write
//! budget across every file it opens. When the budget runs out, the write
//! in flight is cut short and every later write fails, as if the process
//! died mid-append. Recovery is exercised by opening a fresh journal or
//! paging store over [`CrashableFactory::survivor`], which sees exactly the
//! bytes that reached "disk".
//!
//! ## Usage
//!
//! ```rust,ignore
//! let factory = Arc::new(CrashableFactory::new());
//! factory.switch().crash_after(500);
//! // ... write until an IoFailure ...
//! let journal = Journal::with_factory(Arc::new(factory.survivor()), config)?;
//! let loaded = journal.load()?;
//! ```

use parking_lot::Mutex;
use sluice_storage::{
    FileFactory, InMemoryFactory, StorageBackend, StorageError, StorageResult,
};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

fn crash_error(what: &str) -> StorageError {
    StorageError::Io(io::Error::new(
        io::ErrorKind::Other,
        format!("simulated crash during {what}"),
    ))
}

/// The shared write budget of a [`CrashableFactory`].
#[derive(Debug, Default)]
pub struct CrashSwitch {
    budget: Mutex<Option<u64>>,
    crashed: AtomicBool,
    fail_sync: AtomicBool,
}

impl CrashSwitch {
    /// Creates a switch that never fires.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Crashes once `bytes` more bytes have been appended.
    pub fn crash_after(&self, bytes: u64) {
        *self.budget.lock() = Some(bytes);
    }

    /// Makes every sync fail, crashing the "process".
    pub fn set_fail_sync(&self, fail: bool) {
        self.fail_sync.store(fail, Ordering::SeqCst);
    }

    /// Clears the budget and the crashed flag.
    pub fn reset(&self) {
        *self.budget.lock() = None;
        self.crashed.store(false, Ordering::SeqCst);
        self.fail_sync.store(false, Ordering::SeqCst);
    }

    /// Returns whether the switch has fired.
    #[must_use]
    pub fn has_crashed(&self) -> bool {
        self.crashed.load(Ordering::SeqCst)
    }

    /// Takes up to `want` bytes from the budget and returns how many may
    /// be written. Fewer than `want` means the crash happens now.
    fn take(&self, want: usize) -> usize {
        if self.has_crashed() {
            return 0;
        }
        let mut budget = self.budget.lock();
        let Some(remaining) = budget.as_mut() else {
            return want;
        };
        let allowed = (*remaining).min(want as u64);
        *remaining -= allowed;
        if (allowed as usize) < want {
            self.crashed.store(true, Ordering::SeqCst);
        }
        allowed as usize
    }

    fn check(&self, what: &str) -> StorageResult<()> {
        if self.has_crashed() {
            return Err(crash_error(what));
        }
        Ok(())
    }
}

/// A storage backend that stops writing when its [`CrashSwitch`] fires.
pub struct CrashableBackend {
    inner: Box<dyn StorageBackend>,
    switch: Arc<CrashSwitch>,
}

impl CrashableBackend {
    /// Wraps `inner`.
    pub fn new(inner: Box<dyn StorageBackend>, switch: Arc<CrashSwitch>) -> Self {
        Self { inner, switch }
    }
}

impl StorageBackend for CrashableBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        self.inner.read_at(offset, len)
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        self.switch.check("write")?;
        let allowed = self.switch.take(data.len());
        if allowed < data.len() {
            // the bytes that made it before the crash stay behind
            if allowed > 0 {
                let _ = self.inner.append(&data[..allowed]);
            }
            return Err(crash_error("partial write"));
        }
        self.inner.append(data)
    }

    fn flush(&mut self) -> StorageResult<()> {
        self.switch.check("flush")?;
        self.inner.flush()
    }

    fn size(&self) -> StorageResult<u64> {
        self.inner.size()
    }

    fn sync(&mut self) -> StorageResult<()> {
        if self.switch.fail_sync.load(Ordering::SeqCst) {
            self.switch.crashed.store(true, Ordering::SeqCst);
        }
        self.switch.check("sync")?;
        self.inner.sync()
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        self.switch.check("truncate")?;
        self.inner.truncate(new_size)
    }
}

/// A file factory whose files share one [`CrashSwitch`].
#[derive(Debug, Default)]
pub struct CrashableFactory {
    inner: InMemoryFactory,
    switch: Arc<CrashSwitch>,
    fail_open_suffix: Mutex<Option<String>>,
    fail_write_name: Mutex<Option<String>>,
}

impl CrashableFactory {
    /// Creates an empty factory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps an existing in-memory file set.
    #[must_use]
    pub fn over(inner: InMemoryFactory) -> Self {
        Self {
            inner,
            ..Self::default()
        }
    }

    /// Returns the crash switch.
    #[must_use]
    pub fn switch(&self) -> &Arc<CrashSwitch> {
        &self.switch
    }

    /// Returns the files as they are on "disk", for opening after a crash.
    #[must_use]
    pub fn survivor(&self) -> InMemoryFactory {
        self.inner.clone()
    }

    /// Makes opening any file whose name ends with `suffix` fail. Does not
    /// fire the crash switch.
    pub fn fail_opens_ending_with(&self, suffix: Option<&str>) {
        *self.fail_open_suffix.lock() = suffix.map(str::to_string);
    }

    /// Makes atomic writes of the file `name` fail. Does not fire the
    /// crash switch.
    pub fn fail_writes_named(&self, name: Option<&str>) {
        *self.fail_write_name.lock() = name.map(str::to_string);
    }
}

impl FileFactory for CrashableFactory {
    fn open(&self, name: &str) -> StorageResult<Box<dyn StorageBackend>> {
        if let Some(suffix) = &*self.fail_open_suffix.lock() {
            if name.ends_with(suffix.as_str()) {
                return Err(StorageError::Io(io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    format!("refusing to open {name}"),
                )));
            }
        }
        let inner = self.inner.open(name)?;
        Ok(Box::new(CrashableBackend::new(
            inner,
            Arc::clone(&self.switch),
        )))
    }

    fn list(&self, extension: &str) -> StorageResult<Vec<String>> {
        self.inner.list(extension)
    }

    fn exists(&self, name: &str) -> bool {
        self.inner.exists(name)
    }

    fn delete(&self, name: &str) -> StorageResult<()> {
        self.switch.check("delete")?;
        self.inner.delete(name)
    }

    fn rename(&self, from: &str, to: &str) -> StorageResult<()> {
        self.switch.check("rename")?;
        self.inner.rename(from, to)
    }

    fn read_all(&self, name: &str) -> StorageResult<Vec<u8>> {
        self.inner.read_all(name)
    }

    fn write_atomic(&self, name: &str, data: &[u8]) -> StorageResult<()> {
        if self.fail_write_name.lock().as_deref() == Some(name) {
            return Err(StorageError::Io(io::Error::new(
                io::ErrorKind::Other,
                format!("refusing to write {name}"),
            )));
        }
        self.switch.check("write")?;
        self.inner.write_atomic(name, data)
    }

    fn sync_dir(&self) -> StorageResult<()> {
        self.switch.check("sync")?;
        self.inner.sync_dir()
    }
}

/// Removes the last `bytes` bytes of a file.
///
/// # Panics
///
/// Panics if the file does not exist.
pub fn truncate_tail(factory: &InMemoryFactory, name: &str, bytes: usize) {
    let mut data = factory.file_data(name).expect("file exists");
    let len = data.len().saturating_sub(bytes);
    data.truncate(len);
    factory.set_file_data(name, data);
}

/// Inverts one byte of a file.
///
/// # Panics
///
/// Panics if the file does not exist or is shorter than `offset`.
pub fn flip_byte(factory: &InMemoryFactory, name: &str, offset: usize) {
    let mut data = factory.file_data(name).expect("file exists");
    data[offset] ^= 0xFF;
    factory.set_file_data(name, data);
}

/// Returns the last non-empty file with the given extension.
#[must_use]
pub fn last_written_file(factory: &InMemoryFactory, extension: &str) -> Option<String> {
    let suffix = format!(".{extension}");
    factory
        .file_names()
        .into_iter()
        .filter(|name| name.ends_with(&suffix))
        .filter(|name| factory.file_data(name).is_some_and(|data| !data.is_empty()))
        .last()
}
