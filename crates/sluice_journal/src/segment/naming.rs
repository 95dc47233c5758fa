//! Segment file names.

use crate::config::JournalConfig;
use crate::types::SegmentId;

/// Extension of a compaction output that has not been published yet.
pub const COMPACTING_EXTENSION: &str = "cmp";

/// Builds and parses `<prefix>-<id:020>.<ext>` file names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentNaming {
    prefix: String,
    extension: String,
}

impl SegmentNaming {
    /// Creates a naming scheme.
    #[must_use]
    pub fn new(prefix: impl Into<String>, extension: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            extension: extension.into(),
        }
    }

    /// Creates the naming scheme configured for a journal.
    #[must_use]
    pub fn from_config(config: &JournalConfig) -> Self {
        Self::new(&config.file_prefix, &config.file_extension)
    }

    /// Returns the segment file extension.
    #[must_use]
    pub fn extension(&self) -> &str {
        &self.extension
    }

    /// Returns the file name of a published segment.
    #[must_use]
    pub fn file_name(&self, id: SegmentId) -> String {
        format!("{}-{:020}.{}", self.prefix, id.as_u64(), self.extension)
    }

    /// Returns the file name of an unpublished compaction output.
    #[must_use]
    pub fn compacting_name(&self, id: SegmentId) -> String {
        format!("{}-{:020}.{COMPACTING_EXTENSION}", self.prefix, id.as_u64())
    }

    /// Parses a published segment file name.
    #[must_use]
    pub fn parse(&self, name: &str) -> Option<SegmentId> {
        self.parse_with(name, &self.extension)
    }

    /// Parses a compaction output file name.
    #[must_use]
    pub fn parse_compacting(&self, name: &str) -> Option<SegmentId> {
        self.parse_with(name, COMPACTING_EXTENSION)
    }

    fn parse_with(&self, name: &str, extension: &str) -> Option<SegmentId> {
        let digits = name
            .strip_prefix(self.prefix.as_str())?
            .strip_prefix('-')?
            .strip_suffix(extension)?
            .strip_suffix('.')?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok().map(SegmentId)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_sort_in_id_order() {
        let naming = SegmentNaming::new("sluice", "jrn");
        let a = naming.file_name(SegmentId(9));
        let b = naming.file_name(SegmentId(10));
        assert_eq!(a, "sluice-00000000000000000009.jrn");
        assert!(a < b);
    }

    #[test]
    fn parse_round_trips() {
        let naming = SegmentNaming::new("sluice", "jrn");
        assert_eq!(
            naming.parse(&naming.file_name(SegmentId(42))),
            Some(SegmentId(42))
        );
        assert_eq!(
            naming.parse_compacting(&naming.compacting_name(SegmentId(7))),
            Some(SegmentId(7))
        );
    }

    #[test]
    fn parse_rejects_foreign_names() {
        let naming = SegmentNaming::new("sluice", "jrn");
        assert_eq!(naming.parse("LOCK"), None);
        assert_eq!(naming.parse("other-00000000000000000001.jrn"), None);
        assert_eq!(naming.parse("sluice-abc.jrn"), None);
        assert_eq!(naming.parse("sluice-00000000000000000001.cmp"), None);
    }
}
