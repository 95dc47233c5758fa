//! # Sluice Storage
//!
//! Byte-level storage for the Sluice journal and paging stores.
//!
//! Backends are **opaque byte stores**: they append, read, flush and
//! truncate, and know nothing about journal records or page formats.
//! A [`FileFactory`] hands out backends by file name inside one directory,
//! which is how the journal manages its segment files and how each paging
//! store manages its page files.
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - For testing and ephemeral storage
//! - [`FileBackend`] - For persistent storage using OS file APIs
//!
//! ## Available Factories
//!
//! - [`DirectoryFactory`] - One file per name in a directory, with an
//!   exclusive `LOCK` file
//! - [`InMemoryFactory`] - Shared in-memory files that survive "reopen",
//!   used by crash tests
//!
//! ## Example
//!
//! ```rust
//! use sluice_storage::{StorageBackend, InMemoryBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! let offset = backend.append(b"hello world").unwrap();
//! let data = backend.read_at(offset, 11).unwrap();
//! assert_eq!(&data, b"hello world");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod factory;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use factory::{DirectoryFactory, FileFactory, InMemoryFactory};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
