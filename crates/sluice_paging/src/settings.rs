//! Per-address memory settings and the flow-control decision.

use crate::error::{PagingError, PagingResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// The wildcard that matches every address.
pub const MATCH_ANY: &str = "#";

/// What to do with a send once an address is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressFullPolicy {
    /// Write new messages to page files instead of memory.
    #[default]
    Page,
    /// Discard new messages.
    Drop,
    /// Make producers wait for space, up to `block_timeout`.
    Block,
    /// Reject new messages with an error.
    Fail,
}

/// Memory limits of one address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressSettings {
    /// Size at which a page file is sealed and a new one started.
    pub page_size_bytes: u64,

    /// In-memory ceiling. Negative means unlimited.
    pub max_size_bytes: i64,

    /// Usage must fall below `max_size_bytes - hysteresis_bytes` before
    /// paging stops.
    pub hysteresis_bytes: u64,

    /// Behavior once the ceiling is reached.
    pub policy: AddressFullPolicy,

    /// Longest a send waits under [`AddressFullPolicy::Block`].
    pub block_timeout: Duration,
}

impl Default for AddressSettings {
    fn default() -> Self {
        Self {
            page_size_bytes: 10 * 1024 * 1024, // 10 MB
            max_size_bytes: -1,
            hysteresis_bytes: 0,
            policy: AddressFullPolicy::Page,
            block_timeout: Duration::from_secs(30),
        }
    }
}

impl AddressSettings {
    /// Creates settings with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the page size.
    #[must_use]
    pub const fn page_size_bytes(mut self, bytes: u64) -> Self {
        self.page_size_bytes = bytes;
        self
    }

    /// Sets the in-memory ceiling; negative for unlimited.
    #[must_use]
    pub const fn max_size_bytes(mut self, bytes: i64) -> Self {
        self.max_size_bytes = bytes;
        self
    }

    /// Sets the hysteresis margin.
    #[must_use]
    pub const fn hysteresis_bytes(mut self, bytes: u64) -> Self {
        self.hysteresis_bytes = bytes;
        self
    }

    /// Sets the full policy.
    #[must_use]
    pub const fn policy(mut self, policy: AddressFullPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Sets the block timeout.
    #[must_use]
    pub const fn block_timeout(mut self, timeout: Duration) -> Self {
        self.block_timeout = timeout;
        self
    }

    /// Returns whether the address has no ceiling.
    #[must_use]
    pub const fn is_unlimited(&self) -> bool {
        self.max_size_bytes < 0
    }

    /// Returns whether `usage` is above the ceiling.
    #[must_use]
    pub fn is_over(&self, usage: u64) -> bool {
        !self.is_unlimited() && usage > self.max_size_bytes.unsigned_abs()
    }

    /// Returns whether `usage` is low enough to leave paging.
    #[must_use]
    pub fn is_below_exit(&self, usage: u64) -> bool {
        if self.is_unlimited() {
            return true;
        }
        let ceiling = self.max_size_bytes.unsigned_abs();
        usage < ceiling.saturating_sub(self.hysteresis_bytes)
    }

    /// Checks the settings for values a store cannot work with.
    ///
    /// # Errors
    ///
    /// Returns [`PagingError::InvalidArgument`] describing the problem.
    pub fn validate(&self) -> PagingResult<()> {
        if self.page_size_bytes == 0 {
            return Err(PagingError::invalid_argument("page_size_bytes must be positive"));
        }
        if !self.is_unlimited() && self.hysteresis_bytes > self.max_size_bytes.unsigned_abs() {
            return Err(PagingError::invalid_argument(format!(
                "hysteresis of {} bytes exceeds the ceiling of {} bytes",
                self.hysteresis_bytes, self.max_size_bytes
            )));
        }
        Ok(())
    }
}

/// Outcome of [`decide`] for one incoming message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowDecision {
    /// Keep the message in memory.
    Accept,
    /// Write the message to a page file.
    Page,
    /// Wait for space.
    Block,
    /// Refuse the message with an error.
    Reject,
    /// Discard the message silently.
    Drop,
}

/// Decides what happens to a message of `incoming` bytes when the address
/// holds `usage` bytes in memory.
#[must_use]
pub fn decide(usage: u64, incoming: u64, settings: &AddressSettings) -> FlowDecision {
    if !settings.is_over(usage.saturating_add(incoming)) {
        return FlowDecision::Accept;
    }
    match settings.policy {
        AddressFullPolicy::Page => FlowDecision::Page,
        AddressFullPolicy::Drop => FlowDecision::Drop,
        AddressFullPolicy::Block => FlowDecision::Block,
        AddressFullPolicy::Fail => FlowDecision::Reject,
    }
}

/// Address settings resolved by match.
///
/// Lookup order: the exact address, then the longest `prefix.#` wildcard
/// covering it, then `#`. A `prefix.#` pattern also matches `prefix`
/// itself.
#[derive(Debug, Clone, Default)]
pub struct AddressSettingsRepository {
    default: AddressSettings,
    exact: HashMap<String, AddressSettings>,
    wildcards: Vec<(String, AddressSettings)>,
}

impl AddressSettingsRepository {
    /// Creates a repository whose `#` match is `default`.
    #[must_use]
    pub fn new(default: AddressSettings) -> Self {
        Self {
            default,
            ..Self::default()
        }
    }

    /// Registers settings for an address pattern, replacing any previous
    /// settings for the same pattern.
    pub fn add_match(&mut self, pattern: &str, settings: AddressSettings) {
        if pattern == MATCH_ANY {
            self.default = settings;
        } else if let Some(prefix) = pattern.strip_suffix(".#") {
            self.wildcards.retain(|(p, _)| p != prefix);
            self.wildcards.push((prefix.to_string(), settings));
            self.wildcards.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        } else {
            self.exact.insert(pattern.to_string(), settings);
        }
    }

    /// Resolves the settings of an address.
    #[must_use]
    pub fn resolve(&self, address: &str) -> &AddressSettings {
        if let Some(settings) = self.exact.get(address) {
            return settings;
        }
        self.wildcards
            .iter()
            .find(|(prefix, _)| {
                address == prefix
                    || address
                        .strip_prefix(prefix.as_str())
                        .is_some_and(|rest| rest.starts_with('.'))
            })
            .map_or(&self.default, |(_, settings)| settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limited(policy: AddressFullPolicy) -> AddressSettings {
        AddressSettings::new()
            .max_size_bytes(1000)
            .hysteresis_bytes(100)
            .policy(policy)
    }

    #[test]
    fn unlimited_always_accepts() {
        let settings = AddressSettings::default();
        assert_eq!(decide(u64::MAX - 1, 10, &settings), FlowDecision::Accept);
        assert!(settings.is_below_exit(u64::MAX));
    }

    #[test]
    fn decision_follows_policy() {
        assert_eq!(decide(900, 100, &limited(AddressFullPolicy::Page)), FlowDecision::Accept);
        assert_eq!(decide(900, 101, &limited(AddressFullPolicy::Page)), FlowDecision::Page);
        assert_eq!(decide(900, 101, &limited(AddressFullPolicy::Drop)), FlowDecision::Drop);
        assert_eq!(decide(900, 101, &limited(AddressFullPolicy::Block)), FlowDecision::Block);
        assert_eq!(decide(900, 101, &limited(AddressFullPolicy::Fail)), FlowDecision::Reject);
    }

    #[test]
    fn hysteresis_thresholds() {
        let settings = limited(AddressFullPolicy::Page);
        assert!(settings.is_over(1050));
        assert!(!settings.is_over(1000));
        assert!(!settings.is_below_exit(999));
        assert!(!settings.is_below_exit(900));
        assert!(settings.is_below_exit(899));
    }

    #[test]
    fn validate_rejects_bad_values() {
        assert!(AddressSettings::new().page_size_bytes(0).validate().is_err());
        assert!(AddressSettings::new()
            .max_size_bytes(10)
            .hysteresis_bytes(11)
            .validate()
            .is_err());
        limited(AddressFullPolicy::Block).validate().unwrap();
    }

    #[test]
    fn repository_match_order() {
        let mut repo = AddressSettingsRepository::new(AddressSettings::new().page_size_bytes(1));
        repo.add_match("orders.#", AddressSettings::new().page_size_bytes(2));
        repo.add_match("orders.eu.#", AddressSettings::new().page_size_bytes(3));
        repo.add_match("orders.eu.paris", AddressSettings::new().page_size_bytes(4));

        assert_eq!(repo.resolve("billing").page_size_bytes, 1);
        assert_eq!(repo.resolve("orders").page_size_bytes, 2);
        assert_eq!(repo.resolve("orders.us").page_size_bytes, 2);
        assert_eq!(repo.resolve("ordersx").page_size_bytes, 1);
        assert_eq!(repo.resolve("orders.eu.berlin").page_size_bytes, 3);
        assert_eq!(repo.resolve("orders.eu.paris").page_size_bytes, 4);

        repo.add_match(MATCH_ANY, AddressSettings::new().page_size_bytes(9));
        assert_eq!(repo.resolve("billing").page_size_bytes, 9);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn under_the_ceiling_always_accepts(
                max in 1i64..1_000_000,
                usage in 0u64..1_000_000,
                incoming in 0u64..1_000_000,
            ) {
                let settings = AddressSettings::new().max_size_bytes(max).policy(AddressFullPolicy::Fail);
                let decision = decide(usage, incoming, &settings);
                prop_assert_eq!(
                    decision == FlowDecision::Accept,
                    usage + incoming <= max as u64
                );
            }

            #[test]
            fn exit_threshold_is_below_the_ceiling(
                max in 0i64..1_000_000,
                hysteresis in 0u64..1_000_000,
                usage in 0u64..2_000_000,
            ) {
                let settings = AddressSettings::new()
                    .max_size_bytes(max)
                    .hysteresis_bytes(hysteresis);
                if settings.is_below_exit(usage) {
                    prop_assert!(!settings.is_over(usage));
                }
            }
        }
    }
}
