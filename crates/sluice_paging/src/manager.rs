//! The set of paging stores under one directory.
//!
//! Each address gets its own subdirectory named by a random UUID, with the
//! address written to `address.txt`. Address names may hold characters a
//! file system rejects, so the name is never used as a path.

use crate::error::{PagingError, PagingResult};
use crate::settings::{AddressSettings, AddressSettingsRepository};
use crate::store::{AddressStatus, PagingStore};
use parking_lot::RwLock;
use sluice_storage::{DirectoryFactory, FileFactory};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// File in each address directory holding the address name.
pub const ADDRESS_FILE: &str = "address.txt";

/// Configuration of a [`PagingManager`].
#[derive(Debug, Clone)]
pub struct PagingConfig {
    /// Root directory of all address directories.
    pub directory: PathBuf,
    /// Settings for addresses no match covers.
    pub default_settings: AddressSettings,
    /// Whether each page write is synced to disk.
    pub sync_on_write: bool,
}

impl PagingConfig {
    /// Creates a configuration rooted at `directory`.
    #[must_use]
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            default_settings: AddressSettings::default(),
            sync_on_write: true,
        }
    }

    /// Sets the default address settings.
    #[must_use]
    pub fn default_settings(mut self, settings: AddressSettings) -> Self {
        self.default_settings = settings;
        self
    }

    /// Sets whether page writes are synced.
    #[must_use]
    pub fn sync_on_write(mut self, sync: bool) -> Self {
        self.sync_on_write = sync;
        self
    }
}

/// Owns the paging store of every address.
pub struct PagingManager {
    config: PagingConfig,
    settings: RwLock<AddressSettingsRepository>,
    stores: RwLock<HashMap<String, Arc<PagingStore>>>,
    _lock: DirectoryFactory,
}

impl PagingManager {
    /// Opens the paging directory and every address store found in it.
    ///
    /// The root directory is locked for the lifetime of the manager.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory is locked or a store fails to
    /// open.
    pub fn open(config: PagingConfig) -> PagingResult<Self> {
        config.default_settings.validate()?;
        let lock = DirectoryFactory::open(&config.directory)?;
        let settings = AddressSettingsRepository::new(config.default_settings.clone());

        let mut stores = HashMap::new();
        for (address, path) in discover(&config.directory)? {
            let store = open_store(&address, &path, settings.resolve(&address), &config)?;
            stores.insert(address, Arc::new(store));
        }
        info!(
            directory = %config.directory.display(),
            addresses = stores.len(),
            "paging manager opened"
        );

        Ok(Self {
            config,
            settings: RwLock::new(settings),
            stores: RwLock::new(stores),
            _lock: lock,
        })
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &PagingConfig {
        &self.config
    }

    /// Registers settings for an address pattern and applies them to the
    /// open stores they now cover.
    ///
    /// # Errors
    ///
    /// Returns [`PagingError::InvalidArgument`] if the settings are invalid.
    pub fn add_match(&self, pattern: &str, settings: AddressSettings) -> PagingResult<()> {
        settings.validate()?;
        let mut repository = self.settings.write();
        repository.add_match(pattern, settings);
        for (address, store) in self.stores.read().iter() {
            let resolved = repository.resolve(address);
            if *resolved != store.settings() {
                store.set_settings(resolved.clone())?;
            }
        }
        Ok(())
    }

    /// Resolves the settings of an address.
    #[must_use]
    pub fn settings_for(&self, address: &str) -> AddressSettings {
        self.settings.read().resolve(address).clone()
    }

    /// Returns the store of an address, creating it on first use.
    ///
    /// # Errors
    ///
    /// Returns an error if the address directory cannot be created.
    pub fn store(&self, address: &str) -> PagingResult<Arc<PagingStore>> {
        if address.is_empty() {
            return Err(PagingError::invalid_argument("address must not be empty"));
        }
        if let Some(store) = self.stores.read().get(address) {
            return Ok(Arc::clone(store));
        }

        let settings = self.settings_for(address);
        let mut stores = self.stores.write();
        if let Some(store) = stores.get(address) {
            return Ok(Arc::clone(store));
        }
        let path = self.config.directory.join(Uuid::new_v4().to_string());
        let factory = DirectoryFactory::open_unlocked(&path)?;
        factory.write_atomic(ADDRESS_FILE, address.as_bytes())?;
        debug!(address, path = %path.display(), "address directory created");

        let store = Arc::new(open_store(address, &path, &settings, &self.config)?);
        stores.insert(address.to_string(), Arc::clone(&store));
        Ok(store)
    }

    /// Returns the store of an address if it exists.
    #[must_use]
    pub fn get(&self, address: &str) -> Option<Arc<PagingStore>> {
        self.stores.read().get(address).cloned()
    }

    /// Returns whether an address is paging. Unknown addresses are not.
    #[must_use]
    pub fn is_paging(&self, address: &str) -> bool {
        self.get(address).is_some_and(|store| store.is_paging())
    }

    /// Returns the known addresses, sorted.
    #[must_use]
    pub fn addresses(&self) -> Vec<String> {
        let mut addresses: Vec<_> = self.stores.read().keys().cloned().collect();
        addresses.sort();
        addresses
    }

    /// Returns the status of every address, sorted by address.
    #[must_use]
    pub fn status(&self) -> Vec<AddressStatus> {
        let mut status: Vec<_> = self.stores.read().values().map(|s| s.status()).collect();
        status.sort_by(|a, b| a.address.cmp(&b.address));
        status
    }
}

impl std::fmt::Debug for PagingManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PagingManager")
            .field("directory", &self.config.directory)
            .field("addresses", &self.stores.read().len())
            .finish_non_exhaustive()
    }
}

/// Finds address directories under `root`.
fn discover(root: &Path) -> PagingResult<Vec<(String, PathBuf)>> {
    let mut found = Vec::new();
    for entry in fs::read_dir(root)? {
        let path = entry?.path();
        if !path.is_dir() {
            continue;
        }
        let name_file = path.join(ADDRESS_FILE);
        match fs::read_to_string(&name_file) {
            Ok(address) if !address.is_empty() => found.push((address, path)),
            Ok(_) => warn!(path = %path.display(), "empty address file, directory skipped"),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "no address file, directory skipped");
            }
        }
    }
    found.sort();
    Ok(found)
}

fn open_store(
    address: &str,
    path: &Path,
    settings: &AddressSettings,
    config: &PagingConfig,
) -> PagingResult<PagingStore> {
    let factory: Arc<dyn FileFactory> = Arc::new(DirectoryFactory::open_unlocked(path)?);
    Ok(PagingStore::open(address, factory, settings.clone())?.sync_on_write(config.sync_on_write))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::AddressFullPolicy;
    use tempfile::tempdir;

    fn config(dir: &Path) -> PagingConfig {
        PagingConfig::new(dir).sync_on_write(false).default_settings(
            AddressSettings::new()
                .page_size_bytes(64)
                .max_size_bytes(100),
        )
    }

    #[test]
    fn stores_are_created_once() {
        let dir = tempdir().unwrap();
        let manager = PagingManager::open(config(dir.path())).unwrap();
        let first = manager.store("orders/eu").unwrap();
        let again = manager.store("orders/eu").unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert!(manager.store("").is_err());
        assert_eq!(manager.addresses(), vec!["orders/eu"]);
        assert!(!manager.is_paging("orders/eu"));
        assert!(!manager.is_paging("unknown"));
    }

    #[test]
    fn addresses_are_rediscovered() {
        let dir = tempdir().unwrap();
        {
            let manager = PagingManager::open(config(dir.path())).unwrap();
            let store = manager.store("orders").unwrap();
            store.page(b"one").unwrap();
            store.page(b"two").unwrap();
            manager.store("billing").unwrap();
        }

        let manager = PagingManager::open(config(dir.path())).unwrap();
        assert_eq!(manager.addresses(), vec!["billing", "orders"]);
        assert!(manager.is_paging("orders"));
        assert!(!manager.is_paging("billing"));

        let status = manager.status();
        assert_eq!(status[1].address, "orders");
        assert_eq!(status[1].paged_messages, 2);
        assert_eq!(status[1].paged_bytes, 6);
        assert_eq!(status[1].page_count, 1);

        let store = manager.get("orders").unwrap();
        assert_eq!(&store.depage().unwrap().unwrap().payload[..], b"one");
    }

    #[test]
    fn root_is_locked() {
        let dir = tempdir().unwrap();
        let _manager = PagingManager::open(config(dir.path())).unwrap();
        assert!(matches!(
            PagingManager::open(config(dir.path())),
            Err(PagingError::Storage(_))
        ));
    }

    #[test]
    fn matches_apply_to_open_stores() {
        let dir = tempdir().unwrap();
        let manager = PagingManager::open(config(dir.path())).unwrap();
        let store = manager.store("jobs.low").unwrap();

        let drop = AddressSettings::new()
            .max_size_bytes(10)
            .policy(AddressFullPolicy::Drop);
        manager.add_match("jobs.#", drop.clone()).unwrap();
        assert_eq!(store.settings(), drop);
        assert_eq!(manager.settings_for("jobs.high"), drop);
        assert_eq!(manager.settings_for("mail").max_size_bytes, 100);
        assert!(manager
            .add_match("jobs.#", AddressSettings::new().page_size_bytes(0))
            .is_err());
    }
}
