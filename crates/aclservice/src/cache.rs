//! Interface state cache.
//!
//! Holds the latest immutable [`AclInterface`] snapshot per port. Updates
//! are optimistic: read the current snapshot, apply the caller's mutator to
//! a builder seeded from it, then install the result only if nobody else
//! replaced the snapshot in between; otherwise start over. Removal is two
//! phase so jobs still holding a port id see it marked rather than gone.

use aclservice_types::{AclInterface, AclInterfaceBuilder};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, trace};

/// Outcome of [`AclInterfaceCache::remove`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoveOutcome {
    /// First removal: the port is kept but flagged for delete.
    Marked(Arc<AclInterface>),
    /// Second removal of a flagged port: the entry is gone.
    Evicted(Arc<AclInterface>),
    NotFound,
}

/// Concurrent per-port state store.
#[derive(Debug, Default)]
pub struct AclInterfaceCache {
    entries: DashMap<String, Arc<AclInterface>>,
}

impl AclInterfaceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates or updates the port entry and returns the installed value.
    ///
    /// The mutator may run more than once if another writer races this one.
    pub fn add_or_update<F>(&self, interface_id: &str, mut mutator: F) -> Arc<AclInterface>
    where
        F: FnMut(&mut AclInterfaceBuilder),
    {
        loop {
            let previous = self.get(interface_id);
            let mut builder = match &previous {
                Some(existing) => AclInterfaceBuilder::from_existing(existing),
                None => AclInterfaceBuilder::new(interface_id),
            };
            mutator(&mut builder);
            let updated = Arc::new(builder.build());

            if self.compare_and_set(interface_id, previous.as_ref(), &updated) {
                return updated;
            }
            trace!(port = interface_id, "interface cache update raced, retrying");
        }
    }

    /// Updates an existing entry only. Returns `None` if the port is not
    /// cached, otherwise the current value and whether the mutator changed it.
    pub fn update_if_present<F>(
        &self,
        interface_id: &str,
        mut mutator: F,
    ) -> Option<(Arc<AclInterface>, bool)>
    where
        F: FnMut(&mut AclInterfaceBuilder),
    {
        loop {
            let previous = self.get(interface_id)?;
            let mut builder = AclInterfaceBuilder::from_existing(&previous);
            mutator(&mut builder);
            let updated = builder.build();

            if updated == *previous {
                return Some((previous, false));
            }

            let updated = Arc::new(updated);
            if self.compare_and_set(interface_id, Some(&previous), &updated) {
                return Some((updated, true));
            }
            trace!(port = interface_id, "interface cache update raced, retrying");
        }
    }

    /// Installs `updated` only if the entry still holds `expected`
    /// (by pointer) or is still absent when `expected` is `None`.
    fn compare_and_set(
        &self,
        interface_id: &str,
        expected: Option<&Arc<AclInterface>>,
        updated: &Arc<AclInterface>,
    ) -> bool {
        match (self.entries.entry(interface_id.to_string()), expected) {
            (Entry::Occupied(mut entry), Some(expected)) if Arc::ptr_eq(entry.get(), expected) => {
                entry.insert(Arc::clone(updated));
                true
            }
            (Entry::Vacant(entry), None) => {
                entry.insert(Arc::clone(updated));
                true
            }
            _ => false,
        }
    }

    /// First call marks the port for delete, a second call evicts it.
    pub fn remove(&self, interface_id: &str) -> RemoveOutcome {
        match self.entries.entry(interface_id.to_string()) {
            Entry::Occupied(entry) if entry.get().is_marked_for_delete() => {
                debug!(port = interface_id, "evicting interface from cache");
                RemoveOutcome::Evicted(entry.remove())
            }
            Entry::Occupied(mut entry) => {
                let marked = Arc::new(
                    AclInterfaceBuilder::from_existing(entry.get())
                        .marked_for_delete(true)
                        .build(),
                );
                entry.insert(Arc::clone(&marked));
                debug!(port = interface_id, "interface marked for delete");
                RemoveOutcome::Marked(marked)
            }
            Entry::Vacant(_) => RemoveOutcome::NotFound,
        }
    }

    pub fn get(&self, interface_id: &str) -> Option<Arc<AclInterface>> {
        self.entries.get(interface_id).map(|e| Arc::clone(e.value()))
    }

    /// Snapshot of all entries, ordered by interface id.
    pub fn entries(&self) -> Vec<Arc<AclInterface>> {
        let mut all: Vec<_> = self.entries.iter().map(|e| Arc::clone(e.value())).collect();
        all.sort_by(|a, b| a.interface_id().cmp(b.interface_id()));
        all
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::thread;

    #[test]
    fn test_add_creates_from_defaults() {
        let cache = AclInterfaceCache::new();
        let port = cache.add_or_update("p1", |b| b.set_lport_tag(Some(10)));
        assert_eq!(port.interface_id(), "p1");
        assert_eq!(port.lport_tag(), Some(10));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_update_seeds_from_previous() {
        let cache = AclInterfaceCache::new();
        cache.add_or_update("p1", |b| b.set_lport_tag(Some(10)));
        let port = cache.add_or_update("p1", |b| b.set_dp_id(Some(1)));
        assert_eq!(port.lport_tag(), Some(10));
        assert_eq!(port.dp_id(), Some(1));
    }

    #[test]
    fn test_update_if_present() {
        let cache = AclInterfaceCache::new();
        assert!(cache.update_if_present("p1", |b| b.set_dp_id(Some(1))).is_none());
        assert!(cache.is_empty());

        cache.add_or_update("p1", |b| b.set_dp_id(Some(1)));
        let (_, changed) = cache.update_if_present("p1", |b| b.set_dp_id(Some(1))).unwrap();
        assert!(!changed);
        let (port, changed) = cache.update_if_present("p1", |b| b.set_dp_id(Some(2))).unwrap();
        assert!(changed);
        assert_eq!(port.dp_id(), Some(2));
    }

    #[test]
    fn test_two_phase_remove() {
        let cache = AclInterfaceCache::new();
        cache.add_or_update("p1", |b| b.set_lport_tag(Some(10)));

        match cache.remove("p1") {
            RemoveOutcome::Marked(port) => assert!(port.is_marked_for_delete()),
            other => panic!("expected Marked, got {:?}", other),
        }
        assert!(cache.get("p1").unwrap().is_marked_for_delete());

        assert!(matches!(cache.remove("p1"), RemoveOutcome::Evicted(_)));
        assert!(cache.get("p1").is_none());
        assert_eq!(cache.remove("p1"), RemoveOutcome::NotFound);
    }

    #[test]
    fn test_concurrent_updates_converge() {
        let cache = Arc::new(AclInterfaceCache::new());
        cache.add_or_update("p1", |b| b.set_security_groups(Some(Vec::new())));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || {
                    for j in 0..25 {
                        cache.add_or_update("p1", |b| {
                            let mut sgs = b.clone().build().security_groups().unwrap_or(&[]).to_vec();
                            sgs.push(format!("sg-{}-{}", i, j));
                            b.set_security_groups(Some(sgs));
                        });
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let port = cache.get("p1").unwrap();
        assert_eq!(port.security_groups().unwrap().len(), 200);
    }

    #[test]
    fn test_entries_sorted() {
        let cache = AclInterfaceCache::new();
        cache.add_or_update("p2", |_| {});
        cache.add_or_update("p1", |_| {});
        let ids: Vec<_> = cache.entries().iter().map(|p| p.interface_id().to_string()).collect();
        assert_eq!(ids, vec!["p1".to_string(), "p2".to_string()]);
    }
}
