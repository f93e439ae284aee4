//! Lease model and lease-set diffing.
//!
//! A [`Lease`] is a node's claim on a subnet of the cluster network. Leases
//! are owned by the lease store; everything in this crate holds copies.
//!
//! [`LeaseWatcher`] turns raw watch answers (incremental events or full
//! snapshots) into event batches relative to what has been seen so far,
//! filtering out this node's own lease.

use chrono::{DateTime, Utc};
use fabric_types::{IpAddress, IpPrefix};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

/// Attributes published with a lease.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LeaseAttrs {
    /// Routable address of the node holding the lease.
    #[serde(rename = "PublicIP")]
    pub public_ip: IpAddress,
    /// Kind of backend that produced the lease (e.g. "host-gw").
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub backend_type: String,
    /// Backend-specific opaque data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_data: Option<serde_json::Value>,
}

impl LeaseAttrs {
    pub fn new(public_ip: IpAddress, backend_type: impl Into<String>) -> Self {
        Self {
            public_ip,
            backend_type: backend_type.into(),
            backend_data: None,
        }
    }

    /// Returns true if the lease was produced by `kind` (case-insensitive).
    pub fn is_backend(&self, kind: &str) -> bool {
        self.backend_type.eq_ignore_ascii_case(kind)
    }
}

/// A claim on a subnet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Lease {
    pub subnet: IpPrefix,
    pub attrs: LeaseAttrs,
    /// When the lease store will drop the lease unless renewed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration: Option<DateTime<Utc>>,
}

impl Lease {
    pub fn new(subnet: IpPrefix, attrs: LeaseAttrs) -> Self {
        Self {
            subnet,
            attrs,
            expiration: None,
        }
    }

    /// Returns true if both leases claim the same subnet.
    pub fn same_subnet(&self, other: &Lease) -> bool {
        self.subnet.network() == other.subnet.network()
    }
}

/// Type of a lease event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Added,
    Removed,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventType::Added => write!(f, "added"),
            EventType::Removed => write!(f, "removed"),
        }
    }
}

/// A lease add/remove notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventType,
    pub lease: Lease,
}

impl Event {
    pub fn added(lease: Lease) -> Self {
        Self {
            kind: EventType::Added,
            lease,
        }
    }

    pub fn removed(lease: Lease) -> Self {
        Self {
            kind: EventType::Removed,
            lease,
        }
    }
}

/// Answer to a single lease watch call.
///
/// A store answers with `Snapshot` when the caller has no cursor or its cursor
/// fell out of the store's history window.
#[derive(Debug, Clone, PartialEq)]
pub enum LeaseWatchResult {
    Events { events: Vec<Event>, cursor: u64 },
    Snapshot { leases: Vec<Lease>, cursor: u64 },
}

impl LeaseWatchResult {
    /// Index to resume watching from.
    pub fn cursor(&self) -> u64 {
        match self {
            LeaseWatchResult::Events { cursor, .. } | LeaseWatchResult::Snapshot { cursor, .. } => {
                *cursor
            }
        }
    }
}

/// Tracks the live lease set seen through a watch.
#[derive(Debug, Default)]
pub struct LeaseWatcher {
    own_lease: Option<Lease>,
    leases: Vec<Lease>,
}

impl LeaseWatcher {
    pub fn new(own_lease: Option<Lease>) -> Self {
        Self {
            own_lease,
            leases: Vec::new(),
        }
    }

    /// Leases currently believed live (own lease included if the store has it).
    pub fn leases(&self) -> &[Lease] {
        &self.leases
    }

    fn is_own(&self, lease: &Lease) -> bool {
        self.own_lease
            .as_ref()
            .is_some_and(|own| own.same_subnet(lease))
    }

    /// Diffs a full snapshot against the known set.
    ///
    /// Every live lease is reported as `Added` (consumers treat re-adds of an
    /// unchanged lease as no-ops); leases missing from the snapshot are
    /// reported as `Removed`.
    pub fn reset(&mut self, snapshot: Vec<Lease>) -> Vec<Event> {
        let mut batch = Vec::with_capacity(snapshot.len());
        let mut stale = std::mem::take(&mut self.leases);

        for lease in &snapshot {
            if let Some(pos) = stale.iter().position(|old| old.same_subnet(lease)) {
                stale.swap_remove(pos);
            }
            if self.is_own(lease) {
                continue;
            }
            batch.push(Event::added(lease.clone()));
        }

        for lease in stale {
            if self.is_own(&lease) {
                continue;
            }
            batch.push(Event::removed(lease));
        }

        self.leases = snapshot;
        batch
    }

    /// Applies incremental events to the known set.
    pub fn update(&mut self, events: Vec<Event>) -> Vec<Event> {
        let mut batch = Vec::with_capacity(events.len());

        for event in events {
            if self.is_own(&event.lease) {
                continue;
            }
            match event.kind {
                EventType::Added => batch.push(self.add(event.lease)),
                EventType::Removed => batch.push(self.remove(event.lease)),
            }
        }

        batch
    }

    fn add(&mut self, lease: Lease) -> Event {
        match self.leases.iter_mut().find(|l| l.same_subnet(&lease)) {
            Some(existing) => *existing = lease.clone(),
            None => self.leases.push(lease.clone()),
        }
        Event::added(lease)
    }

    fn remove(&mut self, lease: Lease) -> Event {
        match self.leases.iter().position(|l| l.same_subnet(&lease)) {
            Some(pos) => Event::removed(self.leases.swap_remove(pos)),
            None => {
                warn!(subnet = %lease.subnet, "Removed subnet was not found");
                Event::removed(lease)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn lease(subnet: &str, ip: &str) -> Lease {
        Lease::new(
            subnet.parse().unwrap(),
            LeaseAttrs::new(ip.parse().unwrap(), "host-gw"),
        )
    }

    #[test]
    fn test_backend_type_case_insensitive() {
        let attrs = LeaseAttrs::new("192.168.0.1".parse().unwrap(), "Host-GW");
        assert!(attrs.is_backend("host-gw"));
        assert!(!attrs.is_backend("vxlan"));
    }

    #[test]
    fn test_lease_json_shape() {
        let json = r#"{"Subnet":"10.5.1.0/24","Attrs":{"PublicIP":"192.168.0.1","BackendType":"host-gw"}}"#;
        let parsed: Lease = serde_json::from_str(json).unwrap();
        assert_eq!(parsed, lease("10.5.1.0/24", "192.168.0.1"));

        let event = serde_json::to_value(Event::removed(parsed)).unwrap();
        assert_eq!(event["type"], "removed");
    }

    #[test]
    fn test_reset_reports_live_and_vanished() {
        let mut watcher = LeaseWatcher::new(None);
        let first = watcher.reset(vec![
            lease("10.5.1.0/24", "192.168.0.1"),
            lease("10.5.2.0/24", "192.168.0.2"),
        ]);
        assert_eq!(first.len(), 2);
        assert!(first.iter().all(|e| e.kind == EventType::Added));

        let second = watcher.reset(vec![lease("10.5.2.0/24", "192.168.0.22")]);
        assert_eq!(
            second,
            vec![
                Event::added(lease("10.5.2.0/24", "192.168.0.22")),
                Event::removed(lease("10.5.1.0/24", "192.168.0.1")),
            ]
        );
        assert_eq!(watcher.leases().len(), 1);
    }

    #[test]
    fn test_own_lease_is_filtered() {
        let own = lease("10.5.9.0/24", "192.168.0.9");
        let mut watcher = LeaseWatcher::new(Some(own.clone()));

        let batch = watcher.reset(vec![own.clone(), lease("10.5.1.0/24", "192.168.0.1")]);
        assert_eq!(batch, vec![Event::added(lease("10.5.1.0/24", "192.168.0.1"))]);

        let batch = watcher.update(vec![Event::removed(own)]);
        assert!(batch.is_empty());

        let batch = watcher.reset(vec![]);
        assert_eq!(batch, vec![Event::removed(lease("10.5.1.0/24", "192.168.0.1"))]);
    }

    #[test]
    fn test_update_replaces_same_subnet() {
        let mut watcher = LeaseWatcher::new(None);
        watcher.update(vec![Event::added(lease("10.5.1.0/24", "192.168.0.1"))]);
        watcher.update(vec![Event::added(lease("10.5.1.0/24", "192.168.0.7"))]);
        assert_eq!(watcher.leases(), &[lease("10.5.1.0/24", "192.168.0.7")]);

        let batch = watcher.update(vec![Event::removed(lease("10.5.1.0/24", "192.168.0.7"))]);
        assert_eq!(batch.len(), 1);
        assert!(watcher.leases().is_empty());
    }

    #[test]
    fn test_remove_unknown_still_reported() {
        let mut watcher = LeaseWatcher::new(None);
        let batch = watcher.update(vec![Event::removed(lease("10.5.3.0/24", "192.168.0.3"))]);
        assert_eq!(batch, vec![Event::removed(lease("10.5.3.0/24", "192.168.0.3"))]);
    }
}
