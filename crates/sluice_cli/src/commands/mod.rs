//! CLI command implementations.

pub mod compact;
pub mod count;
pub mod dump;
pub mod paging_status;
pub mod verify;

use sluice_journal::{CompactionPolicy, JournalConfig};
use sluice_storage::{DirectoryFactory, FileFactory};
use std::path::Path;
use std::sync::Arc;

/// How the journal's segment files are named and sized.
#[derive(Debug, Clone)]
pub struct JournalArgs {
    /// Segment file prefix.
    pub prefix: String,
    /// Segment file extension.
    pub extension: String,
    /// Segment size in bytes.
    pub segment_size: u64,
}

impl JournalArgs {
    /// Returns a journal configuration for offline use: no pool files, no
    /// background compaction.
    pub fn config(&self) -> JournalConfig {
        JournalConfig::new()
            .file_prefix(self.prefix.clone())
            .file_extension(self.extension.clone())
            .segment_size(self.segment_size)
            .min_segments(0)
            .compaction(CompactionPolicy::disabled())
    }
}

/// Opens a journal directory for reading without taking its lock.
pub fn read_only_files(path: &Path) -> Result<Arc<dyn FileFactory>, Box<dyn std::error::Error>> {
    if !path.is_dir() {
        return Err(format!("{} is not a directory", path.display()).into());
    }
    Ok(Arc::new(DirectoryFactory::open_unlocked(path)?))
}
