//! cmwatch store: the in-RAM resource cache and the initial-sync gate.

#![forbid(unsafe_code)]

use std::sync::{PoisonError, RwLock};

use cmwatch_core::{CacheEntry, ResourceIdentity};
use rustc_hash::FxHashMap;
use serde::Serialize;
use tracing::trace;

mod gate;

pub use gate::SyncGate;

/// Point-in-time copy of the store, ordered by identity.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreSnapshot {
    /// Number of mutations applied when the copy was taken.
    pub epoch: u64,
    pub entries: Vec<CacheEntry>,
}

impl StoreSnapshot {
    pub fn get(&self, id: &ResourceIdentity) -> Option<&CacheEntry> {
        self.entries
            .binary_search_by(|e| e.identity.cmp(id))
            .ok()
            .map(|idx| &self.entries[idx])
    }
}

#[derive(Default)]
struct State {
    epoch: u64,
    map: FxHashMap<ResourceIdentity, CacheEntry>,
}

/// Thread-safe map from identity to last known state.
///
/// Every mutation happens under the write lock, so readers see either the
/// whole of a `put`/`remove` or none of it. The epoch bumps once per mutation.
pub struct ResourceStore {
    state: RwLock<State>,
}

impl Default for ResourceStore {
    fn default() -> Self { Self::new() }
}

impl ResourceStore {
    pub fn new() -> Self { Self { state: RwLock::new(State::default()) } }

    pub fn get(&self, id: &ResourceIdentity) -> Option<CacheEntry> {
        self.read(|s| s.map.get(id).cloned())
    }

    pub fn contains(&self, id: &ResourceIdentity) -> bool {
        self.read(|s| s.map.contains_key(id))
    }

    pub fn len(&self) -> usize { self.read(|s| s.map.len()) }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn epoch(&self) -> u64 { self.read(|s| s.epoch) }

    /// Insert or replace the entry for `entry.identity`, returning the previous one.
    pub fn put(&self, entry: CacheEntry) -> Option<CacheEntry> {
        let (prev, epoch, len) = self.write(|s| {
            let prev = s.map.insert(entry.identity.clone(), entry);
            s.epoch += 1;
            (prev, s.epoch, s.map.len())
        });
        self.publish(epoch, len);
        prev
    }

    pub fn remove(&self, id: &ResourceIdentity) -> Option<CacheEntry> {
        let (prev, epoch, len) = self.write(|s| {
            let prev = s.map.remove(id);
            if prev.is_some() {
                s.epoch += 1;
            }
            (prev, s.epoch, s.map.len())
        });
        if prev.is_some() {
            self.publish(epoch, len);
        }
        prev
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        let (epoch, mut entries) = self.read(|s| (s.epoch, s.map.values().cloned().collect::<Vec<_>>()));
        entries.sort_unstable_by(|a, b| a.identity.cmp(&b.identity));
        StoreSnapshot { epoch, entries }
    }

    pub fn identities(&self) -> Vec<ResourceIdentity> {
        let mut ids = self.read(|s| s.map.keys().cloned().collect::<Vec<_>>());
        ids.sort_unstable();
        ids
    }

    fn publish(&self, epoch: u64, len: usize) {
        trace!(epoch, entries = len, "store mutated");
        metrics::gauge!("cmwatch_store_entries", len as f64);
    }

    // A panicking reader or writer cannot leave a half-applied mutation behind
    // (each closure either completes its insert/remove or does nothing), so a
    // poisoned lock is still safe to use.
    fn read<T>(&self, f: impl FnOnce(&State) -> T) -> T {
        let guard = self.state.read().unwrap_or_else(PoisonError::into_inner);
        f(&guard)
    }

    fn write<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        let mut guard = self.state.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use cmwatch_core::{Payload, SourceObject};
    use std::sync::Arc;

    fn entry(ns: &str, name: &str, rv: &str) -> CacheEntry {
        let payload = Payload::from([("rv".to_string(), rv.to_string())]);
        CacheEntry::observed(SourceObject::new(ResourceIdentity::new(ns, name), rv, payload), Utc::now())
    }

    #[test]
    fn put_replaces_and_remove_returns_previous() {
        let store = ResourceStore::new();
        assert!(store.put(entry("ns", "a", "1")).is_none());
        let prev = store.put(entry("ns", "a", "2")).expect("previous entry");
        assert_eq!(prev.version.as_str(), "1");
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&ResourceIdentity::new("ns", "a")).unwrap().version.as_str(), "2");

        let gone = store.remove(&ResourceIdentity::new("ns", "a")).expect("removed");
        assert_eq!(gone.version.as_str(), "2");
        assert!(store.is_empty());
        assert!(store.remove(&ResourceIdentity::new("ns", "a")).is_none());
    }

    #[test]
    fn snapshot_is_ordered_and_carries_epoch() {
        let store = ResourceStore::new();
        store.put(entry("ns", "c", "1"));
        store.put(entry("a-ns", "z", "1"));
        store.put(entry("ns", "b", "1"));
        let snap = store.snapshot();
        let keys: Vec<String> = snap.entries.iter().map(|e| e.identity.to_string()).collect();
        assert_eq!(keys, vec!["a-ns/z", "ns/b", "ns/c"]);
        assert_eq!(snap.epoch, 3);
        assert!(snap.get(&ResourceIdentity::new("ns", "b")).is_some());
        assert!(snap.get(&ResourceIdentity::new("ns", "x")).is_none());
    }

    #[test]
    fn removing_missing_identity_does_not_bump_epoch() {
        let store = ResourceStore::new();
        store.put(entry("ns", "a", "1"));
        store.remove(&ResourceIdentity::new("ns", "missing"));
        assert_eq!(store.epoch(), 1);
    }

    #[test]
    fn epoch_counts_only_effective_mutations() {
        let store = ResourceStore::new();
        store.put(entry("ns", "a", "1"));
        store.put(entry("ns", "a", "2"));
        store.remove(&ResourceIdentity::new("ns", "a"));
        store.remove(&ResourceIdentity::new("ns", "a"));
        assert_eq!(store.epoch(), 3);
        assert_eq!(store.snapshot().epoch, 3);
        assert!(store.is_empty());
    }

    #[test]
    fn concurrent_readers_never_see_torn_entries() {
        let store = Arc::new(ResourceStore::new());
        let writer = {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                for i in 0..2_000u32 {
                    store.put(entry("ns", "a", &i.to_string()));
                }
            })
        };
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for _ in 0..2_000 {
                        for e in store.snapshot().entries {
                            // payload and version are written together
                            assert_eq!(e.payload.get("rv").map(String::as_str), Some(e.version.as_str()));
                        }
                    }
                })
            })
            .collect();
        writer.join().unwrap();
        for r in readers {
            r.join().unwrap();
        }
        assert_eq!(store.get(&ResourceIdentity::new("ns", "a")).unwrap().version.as_str(), "1999");
    }
}
