//! Routing table mapping virtual hostnames to [`ServicePortEntry`]s.
//!
//! Every entry is reachable under two keys — its `host:port` form and its
//! hostname-only alias — and both resolve to the same `Arc`. The table is
//! append-only: once an entry is indexed it is never replaced, matching
//! the source cluster's own append-only service-port identity.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::entry::ServicePortEntry;

#[derive(Default)]
struct Inner {
    by_key: HashMap<String, Arc<ServicePortEntry>>,
    entries: Vec<Arc<ServicePortEntry>>,
}

/// Concurrent routing table. Cheap to clone (it's an `Arc` internally via
/// its callers), cheap to read, append-only under a write lock.
#[derive(Default)]
pub struct ServicePortRouter {
    inner: RwLock<Inner>,
}

impl ServicePortRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Indexes `item` under both its addresses unless an entry already
    /// claims its `host:port` key, in which case the existing entry wins
    /// and `item` is discarded. Returns the entry now on record and
    /// whether it was already present.
    pub fn add_if_not_exists(&self, item: ServicePortEntry) -> (Arc<ServicePortEntry>, bool) {
        let host_port = item.source_host_port();
        let mut inner = self.inner.write();
        if let Some(existing) = inner.by_key.get(&host_port) {
            return (existing.clone(), true);
        }

        let entry = Arc::new(item);
        let host_name = entry.source_host_name();
        inner.by_key.insert(host_port, entry.clone());
        inner.by_key.insert(host_name, entry.clone());
        inner.entries.push(entry.clone());
        (entry, false)
    }

    /// Looks up an entry by either its `host:port` form or its
    /// hostname-only alias.
    pub fn resolve(&self, host_name_or_port: &str) -> Option<Arc<ServicePortEntry>> {
        self.inner.read().by_key.get(host_name_or_port).cloned()
    }

    /// All distinct entries on record, in insertion order.
    pub fn values(&self) -> Vec<Arc<ServicePortEntry>> {
        self.inner.read().entries.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::TargetPort;
    use kube::core::Selector;

    fn entry(name: &str, port: u16) -> ServicePortEntry {
        ServicePortEntry::new(
            name,
            port,
            None,
            TargetPort::Number(port),
            Selector::default(),
        )
    }

    #[test]
    fn resolves_by_both_addresses() {
        let router = ServicePortRouter::new();
        let (stored, loaded) = router.add_if_not_exists(entry("web", 80));
        assert!(!loaded);

        assert!(Arc::ptr_eq(
            &router.resolve("web:80").unwrap(),
            &stored
        ));
        assert!(Arc::ptr_eq(
            &router.resolve("web-80").unwrap(),
            &stored
        ));
        assert!(router.resolve("missing:1").is_none());
    }

    #[test]
    fn second_insert_for_same_host_port_is_a_noop() {
        let router = ServicePortRouter::new();
        let (first, _) = router.add_if_not_exists(entry("web", 80));
        let (second, loaded) = router.add_if_not_exists(entry("web", 80));
        assert!(loaded);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(router.values().len(), 1);
    }

    #[test]
    fn values_grows_with_distinct_entries() {
        let router = ServicePortRouter::new();
        router.add_if_not_exists(entry("web", 80));
        router.add_if_not_exists(entry("api", 8080));
        assert_eq!(router.values().len(), 2);
    }
}
