use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use cmwatch_core::{CacheEntry, ConsistencyToken, ResourceIdentity, SourceObject, TransitionEvent};
use cmwatch_store::ResourceStore;
use tracing::{debug, trace};

use crate::EngineCounters;

/// Turns source observations into store mutations plus the transitions they imply.
///
/// The reconciler is the only writer of its store. Each method performs the
/// mutation before returning the event, so by the time a handler sees a
/// transition the store already reflects it.
pub struct Reconciler {
    store: Arc<ResourceStore>,
    counters: Arc<EngineCounters>,
    /// Token of the last merged listing.
    listed_at: Option<ConsistencyToken>,
}

impl Reconciler {
    pub fn new(store: Arc<ResourceStore>, counters: Arc<EngineCounters>) -> Self { Self { store, counters, listed_at: None } }

    pub fn store(&self) -> &Arc<ResourceStore> { &self.store }

    /// Merge one observed state. Identical versions are dropped, as are
    /// versions provably older than what the store already holds. An unknown
    /// identity at a version no newer than the last listing was absent from
    /// that listing, so it is already gone.
    pub fn apply_upsert(&mut self, obj: SourceObject) -> Option<TransitionEvent> {
        let ev = match self.store.get(&obj.identity) {
            None if self.listed_after(&obj.version) => {
                debug!(id = %obj.identity, got = %obj.version, "upsert predates last listing; skipped");
                self.counters.stale.inc();
                return None;
            }
            None => {
                let entry = CacheEntry::observed(obj, Utc::now());
                self.store.put(entry.clone());
                TransitionEvent::Added(entry)
            }
            Some(cur) if cur.version == obj.version => {
                trace!(id = %cur.identity, rv = %cur.version, "duplicate version skipped");
                self.counters.deduplicated.inc();
                metrics::counter!("cmwatch_dedup_skipped_total", 1u64);
                return None;
            }
            Some(cur) if obj.version.is_older_than(&cur.version) => {
                debug!(id = %cur.identity, held = %cur.version, got = %obj.version, "stale version skipped");
                self.counters.stale.inc();
                return None;
            }
            Some(old) => {
                let new = CacheEntry::observed(obj, Utc::now());
                self.store.put(new.clone());
                TransitionEvent::Updated { old, new }
            }
        };
        self.counters.record(ev.kind());
        Some(ev)
    }

    /// Remove the entry named by a deletion notice. Unknown identities are
    /// already gone; a notice older than the held version predates a re-creation.
    pub fn apply_delete(&mut self, obj: &SourceObject) -> Option<TransitionEvent> {
        let cur = self.store.get(&obj.identity)?;
        if obj.version.is_older_than(&cur.version) {
            debug!(id = %cur.identity, held = %cur.version, got = %obj.version, "stale deletion skipped");
            self.counters.stale.inc();
            return None;
        }
        self.remove(&obj.identity)
    }

    /// Reconcile against a full listing taken at `token`.
    ///
    /// Listed objects go through [`apply_upsert`](Self::apply_upsert). Held
    /// entries missing from the listing are implicit deletions, except those
    /// whose version is newer than `token`: the watch saw them after the
    /// listing was taken.
    pub fn apply_list(&mut self, items: Vec<SourceObject>, token: &ConsistencyToken) -> Vec<TransitionEvent> {
        let mut listed: HashSet<ResourceIdentity> = HashSet::with_capacity(items.len());
        let mut events = Vec::new();
        // the listing itself is authoritative
        self.listed_at = None;
        for obj in items {
            listed.insert(obj.identity.clone());
            events.extend(self.apply_upsert(obj));
        }
        for id in self.store.identities() {
            if listed.contains(&id) {
                continue;
            }
            let Some(cur) = self.store.get(&id) else { continue };
            if token.is_older_than(&cur.version) {
                debug!(id = %id, held = %cur.version, list_rv = %token, "entry newer than listing kept");
                continue;
            }
            debug!(id = %id, "absent from listing; treating as deleted");
            events.extend(self.remove(&id));
        }
        self.listed_at = Some(token.clone());
        events
    }

    fn listed_after(&self, version: &ConsistencyToken) -> bool {
        self.listed_at.as_ref().is_some_and(|t| matches!(version.compare(t), Some(Ordering::Less | Ordering::Equal)))
    }

    fn remove(&mut self, id: &ResourceIdentity) -> Option<TransitionEvent> {
        let removed = self.store.remove(id)?;
        let ev = TransitionEvent::Deleted(removed);
        self.counters.record(ev.kind());
        Some(ev)
    }
}
