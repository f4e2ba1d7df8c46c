//! Desired channel subscriptions for this instance.
//!
//! The registry records what the instance *wants* to be subscribed to. The
//! transport can silently lose subscriptions across a reconnect, so the
//! registry, not the transport, is the source of truth: [`SubscriptionRegistry::drift`]
//! reports the channels that have to be restored.
//!
//! Pattern subscriptions are tracked separately. Brokers do not list them
//! alongside channels, so they take no part in drift detection and are only
//! restored by a full recovery.

use std::collections::BTreeSet;

use parking_lot::RwLock;

#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    desired: RwLock<BTreeSet<String>>,
    patterns: RwLock<BTreeSet<String>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_channels<I, S>(channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            desired: RwLock::new(channels.into_iter().map(Into::into).collect()),
            patterns: RwLock::default(),
        }
    }

    /// Record `channel` as desired. Returns `false` if it already was.
    pub fn add(&self, channel: impl Into<String>) -> bool {
        self.desired.write().insert(channel.into())
    }

    /// Forget `channel`. Returns `false` if it was not desired.
    pub fn remove(&self, channel: &str) -> bool {
        self.desired.write().remove(channel)
    }

    pub fn contains(&self, channel: &str) -> bool {
        self.desired.read().contains(channel)
    }

    /// Snapshot of the desired channels.
    pub fn desired(&self) -> BTreeSet<String> {
        self.desired.read().clone()
    }

    pub fn len(&self) -> usize {
        self.desired.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.desired.read().is_empty()
    }

    pub fn add_pattern(&self, pattern: impl Into<String>) -> bool {
        self.patterns.write().insert(pattern.into())
    }

    pub fn remove_pattern(&self, pattern: &str) -> bool {
        self.patterns.write().remove(pattern)
    }

    /// Snapshot of the desired patterns.
    pub fn patterns(&self) -> BTreeSet<String> {
        self.patterns.read().clone()
    }

    /// Channels that are desired but absent from `actual`.
    pub fn drift<I, S>(&self, actual: I) -> BTreeSet<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut missing = self.desired();
        for channel in actual {
            missing.remove(channel.as_ref());
        }
        missing
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_is_idempotent() {
        let registry = SubscriptionRegistry::new();
        assert!(registry.add("a"));
        assert!(!registry.add("a"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_remove() {
        let registry = SubscriptionRegistry::with_channels(["a", "b"]);
        assert!(registry.remove("a"));
        assert!(!registry.remove("a"));
        assert!(!registry.contains("a"));
        assert!(registry.contains("b"));
    }

    #[test]
    fn test_drift_reports_missing_channels() {
        let registry = SubscriptionRegistry::with_channels(["A", "B", "C"]);
        let drift = registry.drift(["A", "C"]);
        assert_eq!(drift, BTreeSet::from(["B".to_string()]));
    }

    #[test]
    fn test_drift_ignores_extra_actual_channels() {
        let registry = SubscriptionRegistry::with_channels(["A"]);
        assert!(registry.drift(["A", "other-instance-channel"]).is_empty());
    }

    #[test]
    fn test_patterns_are_kept_apart_from_channels() {
        let registry = SubscriptionRegistry::with_channels(["A"]);
        assert!(registry.add_pattern("user:*"));
        assert!(!registry.add_pattern("user:*"));

        assert_eq!(registry.len(), 1);
        assert!(!registry.contains("user:*"));
        assert!(registry.drift(["A"]).is_empty());
        assert_eq!(registry.patterns(), BTreeSet::from(["user:*".to_string()]));

        assert!(registry.remove_pattern("user:*"));
        assert!(registry.patterns().is_empty());
    }

    #[test]
    fn test_drift_with_nothing_reported() {
        let registry = SubscriptionRegistry::with_channels(["A", "B"]);
        let none: [&str; 0] = [];
        assert_eq!(registry.drift(none), registry.desired());
    }
}
