//! # Sluice Testkit
//!
//! Test utilities for Sluice.
//!
//! This crate provides:
//! - Crash simulation over in-memory files
//! - Journal and paging fixtures that survive a "restart"
//! - Property-based workload generators using proptest
//! - A reference model of the journal's live set
//!
//! ## Usage
//!
//! ```rust,ignore
//! use sluice_testkit::prelude::*;
//!
//! #[test]
//! fn survives_restart() {
//!     let journal = TestJournal::memory();
//!     journal.add(1, 0, b"one".to_vec()).unwrap();
//!     let journal = journal.restart();
//!     assert_eq!(journal.loaded.records.len(), 1);
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod crash;
pub mod fixtures;
pub mod generators;
pub mod model;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::crash::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::model::*;
}

pub use crash::*;
pub use fixtures::*;
pub use generators::*;
pub use model::*;
