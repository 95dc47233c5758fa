//! # Sluice Paging
//!
//! Per-address paging stores and memory flow control for the Sluice
//! broker.
//!
//! When an address holds more than its configured memory ceiling, new
//! messages are written to page files on disk instead. Consumers read them
//! back in send order, and the address returns to memory once the pages
//! have drained and usage has fallen below the ceiling minus a hysteresis
//! margin. Addresses can instead drop, block or reject sends when full.
//!
//! ## Example
//!
//! ```rust,no_run
//! use sluice_paging::{AddressSettings, PagingConfig, PagingManager, RouteOutcome};
//!
//! let config = PagingConfig::new("/var/lib/broker/paging")
//!     .default_settings(AddressSettings::new().max_size_bytes(64 * 1024 * 1024));
//! let manager = PagingManager::open(config)?;
//!
//! let store = manager.store("orders")?;
//! match store.route(b"payload")? {
//!     RouteOutcome::InMemory => { /* deliver from memory */ }
//!     RouteOutcome::Paged(_) => { /* depage later */ }
//!     RouteOutcome::Dropped => {}
//! }
//! # Ok::<(), sluice_paging::PagingError>(())
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod manager;
mod page;
mod settings;
mod store;

pub use error::{PagingError, PagingResult};
pub use manager::{PagingConfig, PagingManager, ADDRESS_FILE};
pub use page::{encode_frame, page_file_name, parse_page_file_name, FRAME_OVERHEAD, PAGE_EXTENSION};
pub use settings::{
    decide, AddressFullPolicy, AddressSettings, AddressSettingsRepository, FlowDecision, MATCH_ANY,
};
pub use store::{AddressStatus, DepagedMessage, PagePosition, PagingStore, RouteOutcome};
