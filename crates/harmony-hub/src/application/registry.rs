//! HubRegistry: the discovery engine's record of every hub it has heard from.
//!
//! Each entry moves through a small state machine:
//!
//! ```text
//! (unknown) ──report──►  Online  ──no report for expiry threshold──►  Offline
//!                          ▲                                             │
//!                          └─────────────────report───────────────────────┘
//! ```
//!
//! Only transitions into Online (first sighting, or a return from Offline)
//! and transitions into Offline are reported to the caller.  A report for a
//! hub that is already Online just refreshes it.  Entries are never removed.
//!
//! The registry holds no clock: callers pass `now` in, which keeps it free
//! of I/O and lets tests drive time directly.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use harmony_core::{DeviceDigest, HubState};

/// In-memory registry keyed by [`DeviceDigest::key`].
#[derive(Debug, Default)]
pub struct HubRegistry {
    hubs: HashMap<String, DeviceDigest>,
}

impl HubRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a fresh report.
    ///
    /// Returns the digest when the hub is new or was Offline, which is the
    /// moment discovery listeners need to hear about it.
    pub fn observe(&mut self, mut digest: DeviceDigest) -> Option<DeviceDigest> {
        digest.state = HubState::Online;
        let key = digest.key();

        // A full report supersedes an earlier partial one from the same address.
        let mut was_online = self.take_partial(&digest).is_some_and(|p| p.is_online());

        if let Some(previous) = self.hubs.get(&key) {
            was_online |= previous.is_online();
        }
        self.hubs.insert(key, digest.clone());

        (!was_online).then_some(digest)
    }

    /// Marks every Online hub not seen within `max_age` as Offline.
    ///
    /// Returns one digest per transition.
    pub fn expire(&mut self, now: Instant, max_age: Duration) -> Vec<DeviceDigest> {
        let mut expired = Vec::new();
        for digest in self.hubs.values_mut() {
            if digest.is_online() && now.saturating_duration_since(digest.last_seen) > max_age {
                digest.state = HubState::Offline;
                expired.push(digest.clone());
            }
        }
        expired
    }

    pub fn get(&self, key: &str) -> Option<&DeviceDigest> {
        self.hubs.get(key)
    }

    /// Returns a snapshot of all hubs.
    pub fn all(&self) -> Vec<DeviceDigest> {
        self.hubs.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.hubs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hubs.is_empty()
    }

    fn take_partial(&mut self, digest: &DeviceDigest) -> Option<DeviceDigest> {
        digest.uuid.as_ref()?;
        let address_key = digest.address.to_string();
        match self.hubs.get(&address_key) {
            Some(partial) if partial.uuid.is_none() => self.hubs.remove(&address_key),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use harmony_core::protocol::codec::fields;
    use harmony_core::WireValue;
    use std::net::IpAddr;

    fn report(uuid: Option<&str>, ip: &str, at: Instant) -> DeviceDigest {
        let mut pairs: Vec<(&str, WireValue)> = vec![("ip", ip.into()), ("friendlyName", "Den".into())];
        if let Some(uuid) = uuid {
            pairs.push(("uuid", uuid.into()));
        }
        let peer: IpAddr = ip.parse().unwrap();
        DeviceDigest::from_report(fields(pairs), peer, at)
    }

    #[test]
    fn test_registry_starts_empty() {
        let registry = HubRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.all().is_empty());
    }

    #[test]
    fn test_first_report_is_emitted() {
        // Arrange
        let mut registry = HubRegistry::new();
        let now = Instant::now();

        // Act
        let emitted = registry.observe(report(Some("hub-1"), "10.0.0.2", now));

        // Assert
        let digest = emitted.expect("new hub must be emitted");
        assert_eq!(digest.state, HubState::Online);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_repeat_report_while_online_is_silent_but_refreshes() {
        // Arrange
        let mut registry = HubRegistry::new();
        let t0 = Instant::now();
        let t1 = t0 + Duration::from_secs(3);
        registry.observe(report(Some("hub-1"), "10.0.0.2", t0));

        // Act
        let emitted = registry.observe(report(Some("hub-1"), "10.0.0.2", t1));

        // Assert
        assert!(emitted.is_none());
        assert_eq!(registry.get("hub-1").unwrap().last_seen, t1);
    }

    #[test]
    fn test_expire_marks_stale_hub_offline_exactly_once() {
        // Arrange
        let mut registry = HubRegistry::new();
        let t0 = Instant::now();
        let max_age = Duration::from_secs(10);
        registry.observe(report(Some("hub-1"), "10.0.0.2", t0));

        // Act
        let fresh = registry.expire(t0 + Duration::from_secs(5), max_age);
        let first = registry.expire(t0 + Duration::from_secs(11), max_age);
        let second = registry.expire(t0 + Duration::from_secs(20), max_age);

        // Assert
        assert!(fresh.is_empty());
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].state, HubState::Offline);
        assert!(second.is_empty());
        assert_eq!(registry.get("hub-1").unwrap().state, HubState::Offline);
    }

    #[test]
    fn test_report_after_offline_is_emitted_again() {
        // Arrange
        let mut registry = HubRegistry::new();
        let t0 = Instant::now();
        registry.observe(report(Some("hub-1"), "10.0.0.2", t0));
        registry.expire(t0 + Duration::from_secs(11), Duration::from_secs(10));

        // Act
        let later = t0 + Duration::from_secs(12);
        let emitted = registry.observe(report(Some("hub-1"), "10.0.0.2", later));

        // Assert
        assert_eq!(emitted.map(|d| d.state), Some(HubState::Online));
    }

    #[test]
    fn test_partial_report_is_keyed_by_address() {
        let mut registry = HubRegistry::new();
        let emitted = registry.observe(report(None, "10.0.0.7", Instant::now()));
        assert!(emitted.is_some());
        assert!(registry.get("10.0.0.7").is_some());
    }

    #[test]
    fn test_full_report_replaces_online_partial_without_emitting() {
        // Arrange
        let mut registry = HubRegistry::new();
        let now = Instant::now();
        registry.observe(report(None, "10.0.0.7", now));

        // Act
        let emitted = registry.observe(report(Some("hub-7"), "10.0.0.7", now));

        // Assert
        assert!(emitted.is_none());
        assert_eq!(registry.len(), 1);
        assert!(registry.get("10.0.0.7").is_none());
        assert!(registry.get("hub-7").is_some());
    }

    #[test]
    fn test_distinct_hubs_are_tracked_separately() {
        let mut registry = HubRegistry::new();
        let now = Instant::now();
        assert!(registry.observe(report(Some("a"), "10.0.0.2", now)).is_some());
        assert!(registry.observe(report(Some("b"), "10.0.0.3", now)).is_some());
        assert_eq!(registry.len(), 2);
    }
}
