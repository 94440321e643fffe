#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cmwatch_core::{
    BackoffConfig, CacheEntry, ChangeSource, ConsistencyToken, HandlerError, ListPage, Payload, ResourceIdentity,
    SourceError, SourceObject, SourceResult, WatchEvent, WatchStream,
};
use cmwatch_engine::{EngineConfig, Handler};
use tokio::sync::mpsc;

pub fn id(name: &str) -> ResourceIdentity { ResourceIdentity::new("ns", name) }

pub fn data(pairs: &[(&str, &str)]) -> Payload {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

pub fn config(target: &str) -> EngineConfig {
    EngineConfig::new(id(target))
        .with_resync_interval(Duration::from_secs(3600))
        .with_retry(BackoffConfig {
            initial: Duration::from_millis(20),
            max: Duration::from_millis(100),
            factor: 2,
            max_attempts: 0,
        })
}

#[derive(Default)]
struct Cluster {
    rv: u64,
    objects: BTreeMap<ResourceIdentity, (u64, Payload)>,
}

/// In-memory stand-in for the cluster API: a versioned object table plus
/// the currently open watch, with failure injection.
#[derive(Default)]
pub struct FakeSource {
    cluster: Mutex<Cluster>,
    list_failures: Mutex<VecDeque<SourceError>>,
    watch_failures: Mutex<VecDeque<SourceError>>,
    watcher: Mutex<Option<mpsc::UnboundedSender<SourceResult<WatchEvent>>>>,
    watch_from: Mutex<Vec<String>>,
    list_calls: AtomicUsize,
    watch_calls: AtomicUsize,
}

impl FakeSource {
    pub fn new() -> Arc<Self> { Arc::new(Self::default()) }

    /// Create or modify an object. `live` delivers the change to the open
    /// watch; otherwise it is only visible to the next list.
    pub fn upsert(&self, id: &ResourceIdentity, payload: Payload, live: bool) -> u64 {
        let rv = {
            let mut c = self.cluster.lock().unwrap();
            c.rv += 1;
            let rv = c.rv;
            c.objects.insert(id.clone(), (rv, payload.clone()));
            rv
        };
        if live {
            self.push(Ok(WatchEvent::Upsert(SourceObject::new(id.clone(), rv.to_string(), payload))));
        }
        rv
    }

    pub fn delete(&self, id: &ResourceIdentity, live: bool) {
        let removed = {
            let mut c = self.cluster.lock().unwrap();
            c.rv += 1;
            let rv = c.rv;
            c.objects.remove(id).map(|(_, payload)| (rv, payload))
        };
        if let (true, Some((rv, payload))) = (live, removed) {
            self.push(Ok(WatchEvent::Delete(SourceObject::new(id.clone(), rv.to_string(), payload))));
        }
    }

    /// Send a raw item to the open watch, if any.
    pub fn push(&self, item: SourceResult<WatchEvent>) -> bool {
        match self.watcher.lock().unwrap().as_ref() {
            Some(tx) => tx.send(item).is_ok(),
            None => false,
        }
    }

    /// Break the open watch with a transient error.
    pub fn disconnect(&self) {
        if let Some(tx) = self.watcher.lock().unwrap().take() {
            let _ = tx.send(Err(SourceError::Transient("connection reset".into())));
        }
    }

    /// Close the open watch without an error, as a server-side timeout does.
    pub fn end_watch(&self) { self.watcher.lock().unwrap().take(); }

    pub fn fail_lists(&self, errs: impl IntoIterator<Item = SourceError>) {
        self.list_failures.lock().unwrap().extend(errs);
    }

    pub fn fail_watches(&self, errs: impl IntoIterator<Item = SourceError>) {
        self.watch_failures.lock().unwrap().extend(errs);
    }

    pub fn list_calls(&self) -> usize { self.list_calls.load(Ordering::SeqCst) }

    pub fn watch_calls(&self) -> usize { self.watch_calls.load(Ordering::SeqCst) }

    /// Resume token passed to each `watch` call, in order.
    pub fn watch_tokens(&self) -> Vec<String> { self.watch_from.lock().unwrap().clone() }

    pub fn has_watcher(&self) -> bool { self.watcher.lock().unwrap().is_some() }

    /// Current objects as `(identity, version, payload)`.
    pub fn state(&self) -> Vec<(ResourceIdentity, String, Payload)> {
        let c = self.cluster.lock().unwrap();
        c.objects.iter().map(|(id, (rv, p))| (id.clone(), rv.to_string(), p.clone())).collect()
    }
}

#[async_trait::async_trait]
impl ChangeSource for FakeSource {
    async fn list(&self, _target: &ResourceIdentity) -> SourceResult<ListPage> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(e) = self.list_failures.lock().unwrap().pop_front() {
            return Err(e);
        }
        let c = self.cluster.lock().unwrap();
        let items = c
            .objects
            .iter()
            .map(|(id, (rv, p))| SourceObject::new(id.clone(), rv.to_string(), p.clone()))
            .collect();
        Ok(ListPage { items, token: ConsistencyToken::new(c.rv.to_string()) })
    }

    async fn watch(&self, _target: &ResourceIdentity, from: &ConsistencyToken) -> SourceResult<WatchStream> {
        self.watch_calls.fetch_add(1, Ordering::SeqCst);
        self.watch_from.lock().unwrap().push(from.to_string());
        if let Some(e) = self.watch_failures.lock().unwrap().pop_front() {
            return Err(e);
        }
        let (tx, mut rx) = mpsc::unbounded_channel();
        *self.watcher.lock().unwrap() = Some(tx);
        Ok(Box::pin(async_stream::stream! {
            while let Some(item) = rx.recv().await {
                yield item;
            }
        }))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Seen {
    Added(String, String),
    Updated(String, String, String),
    Deleted(String, String),
}

impl Seen {
    pub fn key(&self) -> &str {
        match self {
            Seen::Added(k, _) | Seen::Updated(k, _, _) | Seen::Deleted(k, _) => k,
        }
    }
}

/// Handler that records what it was given.
#[derive(Clone, Default)]
pub struct Recorder {
    seen: Arc<Mutex<Vec<Seen>>>,
}

impl Recorder {
    pub fn events(&self) -> Vec<Seen> { self.seen.lock().unwrap().clone() }

    pub async fn wait_len(&self, n: usize) -> Vec<Seen> {
        eventually(&format!("{n} recorded events"), || self.seen.lock().unwrap().len() >= n).await;
        self.events()
    }
}

#[async_trait::async_trait]
impl Handler for Recorder {
    fn name(&self) -> &str { "recorder" }

    async fn on_added(&self, e: &CacheEntry) -> Result<(), HandlerError> {
        self.seen.lock().unwrap().push(Seen::Added(e.identity.to_string(), e.version.to_string()));
        Ok(())
    }

    async fn on_updated(&self, old: &CacheEntry, new: &CacheEntry) -> Result<(), HandlerError> {
        assert_eq!(old.identity, new.identity);
        self.seen.lock().unwrap().push(Seen::Updated(new.identity.to_string(), old.version.to_string(), new.version.to_string()));
        Ok(())
    }

    async fn on_deleted(&self, e: &CacheEntry) -> Result<(), HandlerError> {
        self.seen.lock().unwrap().push(Seen::Deleted(e.identity.to_string(), e.version.to_string()));
        Ok(())
    }
}

/// Poll `cond` until it holds, failing the test after five seconds.
pub async fn eventually(what: &str, cond: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
