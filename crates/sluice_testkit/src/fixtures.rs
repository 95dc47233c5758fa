//! Journal and paging fixtures.

use sluice_journal::{CompactionPolicy, Journal, JournalConfig, LoadedJournal, Record};
use sluice_paging::{AddressSettings, PagingConfig, PagingManager};
use sluice_storage::{FileFactory, InMemoryFactory};
use std::collections::BTreeMap;
use std::sync::Arc;
use tempfile::TempDir;

/// A configuration with small segments, no pool and compaction left to
/// the test. A manual run rewrites every segment holding dead bytes.
#[must_use]
pub fn small_config() -> JournalConfig {
    JournalConfig::new()
        .segment_size(512)
        .min_segments(0)
        .sync_on_write(false)
        .compaction(CompactionPolicy::disabled().candidate_occupancy(100))
}

/// An in-memory journal that can be "restarted" over the same files.
pub struct TestJournal {
    /// The open journal.
    pub journal: Journal,
    /// What `load` returned.
    pub loaded: LoadedJournal,
    factory: InMemoryFactory,
    config: JournalConfig,
}

impl TestJournal {
    /// Opens and loads an empty journal with [`small_config`].
    pub fn memory() -> Self {
        Self::with_config(small_config())
    }

    /// Opens and loads an empty journal.
    pub fn with_config(config: JournalConfig) -> Self {
        Self::over(InMemoryFactory::new(), config)
    }

    /// Opens and loads a journal over existing files.
    pub fn over(factory: InMemoryFactory, config: JournalConfig) -> Self {
        let journal = Journal::with_factory(Arc::new(factory.clone()), config.clone())
            .expect("open journal");
        let loaded = journal.load().expect("load journal");
        Self {
            journal,
            loaded,
            factory,
            config,
        }
    }

    /// Drops the journal and loads a new one over the same files.
    #[must_use]
    pub fn restart(self) -> Self {
        let Self {
            journal,
            factory,
            config,
            ..
        } = self;
        drop(journal);
        Self::over(factory, config)
    }

    /// Returns the file set.
    #[must_use]
    pub fn factory(&self) -> &InMemoryFactory {
        &self.factory
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &JournalConfig {
        &self.config
    }
}

impl std::ops::Deref for TestJournal {
    type Target = Journal;

    fn deref(&self) -> &Self::Target {
        &self.journal
    }
}

/// Loads a fresh journal over `factory`, returning what it recovered.
///
/// # Panics
///
/// Panics if the journal cannot be opened or loaded.
pub fn reload(factory: Arc<dyn FileFactory>, config: &JournalConfig) -> LoadedJournal {
    let journal = Journal::with_factory(factory, config.clone()).expect("open journal");
    journal.load().expect("load journal")
}

/// Returns the recovered records keyed by id.
#[must_use]
pub fn live_set(loaded: &LoadedJournal) -> BTreeMap<u64, Record> {
    loaded
        .records
        .iter()
        .map(|record| (record.id, record.clone()))
        .collect()
}

/// A paging manager in a temporary directory.
pub struct TestPaging {
    /// The open manager.
    pub manager: PagingManager,
    dir: TempDir,
    settings: AddressSettings,
}

impl TestPaging {
    /// Opens a manager whose addresses default to `settings`.
    pub fn new(settings: AddressSettings) -> Self {
        let dir = TempDir::new().expect("create temp directory");
        let manager = PagingManager::open(Self::config(&dir, &settings)).expect("open paging");
        Self {
            manager,
            dir,
            settings,
        }
    }

    /// Drops the manager and opens a new one over the same directory.
    #[must_use]
    pub fn restart(self) -> Self {
        let Self {
            manager,
            dir,
            settings,
        } = self;
        drop(manager);
        let manager = PagingManager::open(Self::config(&dir, &settings)).expect("reopen paging");
        Self {
            manager,
            dir,
            settings,
        }
    }

    fn config(dir: &TempDir, settings: &AddressSettings) -> PagingConfig {
        PagingConfig::new(dir.path())
            .default_settings(settings.clone())
            .sync_on_write(false)
    }
}

impl std::ops::Deref for TestPaging {
    type Target = PagingManager;

    fn deref(&self) -> &Self::Target {
        &self.manager
    }
}
