//! Journal configuration.

use crate::error::{JournalError, JournalResult};
use crate::record::MIN_RECORD_SIZE;
use std::time::Duration;

/// Thresholds that decide when the compactor runs.
///
/// Both rules are independent; a value of `0` disables that rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionPolicy {
    /// Run when dead bytes make up at least this percentage of all sealed
    /// segment bytes.
    pub compact_percentage: u32,

    /// Run when at least this many sealed segments are candidates.
    pub compact_min_segments: usize,

    /// A segment whose live percentage is below this value is a compaction
    /// candidate. A run rewrites the oldest unbroken run of candidates.
    pub candidate_occupancy: u32,

    /// How often the background compactor evaluates the policy.
    pub check_interval: Duration,
}

impl Default for CompactionPolicy {
    fn default() -> Self {
        Self {
            compact_percentage: 30,
            compact_min_segments: 10,
            candidate_occupancy: 30,
            check_interval: Duration::from_secs(30),
        }
    }
}

impl CompactionPolicy {
    /// Creates a policy with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a policy that never triggers on its own.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            compact_percentage: 0,
            compact_min_segments: 0,
            ..Self::default()
        }
    }

    /// Sets the dead-byte percentage rule.
    #[must_use]
    pub const fn compact_percentage(mut self, percent: u32) -> Self {
        self.compact_percentage = percent;
        self
    }

    /// Sets the candidate-count rule.
    #[must_use]
    pub const fn compact_min_segments(mut self, count: usize) -> Self {
        self.compact_min_segments = count;
        self
    }

    /// Sets the occupancy below which a segment is a candidate.
    #[must_use]
    pub const fn candidate_occupancy(mut self, percent: u32) -> Self {
        self.candidate_occupancy = percent;
        self
    }

    /// Sets the background check interval.
    #[must_use]
    pub const fn check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    /// Returns whether either rule fires for the given figures.
    #[must_use]
    pub fn should_compact(&self, sealed_bytes: u64, dead_bytes: u64, candidates: usize) -> bool {
        if dead_bytes == 0 {
            return false;
        }
        let by_ratio = self.compact_percentage > 0
            && sealed_bytes > 0
            && dead_bytes.saturating_mul(100) >= u64::from(self.compact_percentage) * sealed_bytes;
        let by_count = self.compact_min_segments > 0 && candidates >= self.compact_min_segments;
        by_ratio || by_count
    }
}

/// Configuration for opening a journal.
#[derive(Debug, Clone)]
pub struct JournalConfig {
    /// Logical capacity of a segment file in bytes.
    pub segment_size: u64,

    /// Number of empty segment files kept allocated ahead of the writer.
    pub min_segments: usize,

    /// File name prefix for segment files.
    pub file_prefix: String,

    /// File name extension for segment files (without the dot).
    pub file_extension: String,

    /// Whether every append is fsynced before it is acknowledged.
    pub sync_on_write: bool,

    /// Compaction thresholds.
    pub compaction: CompactionPolicy,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            segment_size: 10 * 1024 * 1024, // 10 MB
            min_segments: 2,
            file_prefix: "sluice".to_string(),
            file_extension: "jrn".to_string(),
            sync_on_write: true,
            compaction: CompactionPolicy::default(),
        }
    }
}

impl JournalConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the segment capacity.
    #[must_use]
    pub const fn segment_size(mut self, size: u64) -> Self {
        self.segment_size = size;
        self
    }

    /// Sets the size of the pre-allocated segment pool.
    #[must_use]
    pub const fn min_segments(mut self, count: usize) -> Self {
        self.min_segments = count;
        self
    }

    /// Sets the segment file prefix.
    #[must_use]
    pub fn file_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.file_prefix = prefix.into();
        self
    }

    /// Sets the segment file extension.
    #[must_use]
    pub fn file_extension(mut self, extension: impl Into<String>) -> Self {
        self.file_extension = extension.into();
        self
    }

    /// Sets whether appends are fsynced.
    #[must_use]
    pub const fn sync_on_write(mut self, value: bool) -> Self {
        self.sync_on_write = value;
        self
    }

    /// Sets the compaction policy.
    #[must_use]
    pub fn compaction(mut self, policy: CompactionPolicy) -> Self {
        self.compaction = policy;
        self
    }

    /// Checks the configuration for values the journal cannot work with.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError::InvalidArgument`] describing the first problem.
    pub fn validate(&self) -> JournalResult<()> {
        if self.segment_size < MIN_RECORD_SIZE as u64 * 2 {
            return Err(JournalError::invalid_argument(format!(
                "segment_size {} is too small",
                self.segment_size
            )));
        }
        if self.file_prefix.is_empty() || self.file_prefix.contains(['/', '\\', '-']) {
            return Err(JournalError::invalid_argument(format!(
                "invalid file prefix {:?}",
                self.file_prefix
            )));
        }
        if self.file_extension.is_empty() || self.file_extension.contains(['/', '\\', '.']) {
            return Err(JournalError::invalid_argument(format!(
                "invalid file extension {:?}",
                self.file_extension
            )));
        }
        if self.compaction.compact_percentage > 100 || self.compaction.candidate_occupancy > 100 {
            return Err(JournalError::invalid_argument(
                "compaction percentages must be between 0 and 100",
            ));
        }
        if self.compaction.check_interval.is_zero() {
            return Err(JournalError::invalid_argument(
                "compaction check_interval must be positive",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        JournalConfig::default().validate().unwrap();
    }

    #[test]
    fn builder_overrides() {
        let config = JournalConfig::new()
            .segment_size(4096)
            .min_segments(0)
            .file_prefix("broker")
            .file_extension("log")
            .sync_on_write(false);
        assert_eq!(config.segment_size, 4096);
        assert_eq!(config.min_segments, 0);
        assert_eq!(config.file_prefix, "broker");
        assert!(!config.sync_on_write);
        config.validate().unwrap();
    }

    #[test]
    fn rejects_tiny_segments_and_bad_names() {
        assert!(JournalConfig::new().segment_size(8).validate().is_err());
        assert!(JournalConfig::new().file_prefix("a-b").validate().is_err());
        assert!(JournalConfig::new().file_extension("").validate().is_err());
        let policy = CompactionPolicy::new().compact_percentage(101);
        assert!(JournalConfig::new().compaction(policy).validate().is_err());
    }

    #[test]
    fn ratio_rule_boundaries() {
        let policy = CompactionPolicy::disabled().compact_percentage(30);
        assert!(!policy.should_compact(1000, 299, 0));
        assert!(policy.should_compact(1000, 300, 0));
        assert!(!policy.should_compact(0, 0, 0));
    }

    #[test]
    fn count_rule_boundaries() {
        let policy = CompactionPolicy::disabled().compact_min_segments(3);
        assert!(!policy.should_compact(1000, 10, 2));
        assert!(policy.should_compact(1000, 10, 3));
        assert!(!policy.should_compact(1000, 0, 5));
    }

    #[test]
    fn disabled_policy_never_fires() {
        let policy = CompactionPolicy::disabled();
        assert!(!policy.should_compact(1000, 1000, 100));
    }
}
