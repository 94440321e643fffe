//! cmwatch core types: identities, cache entries, transitions and the change source contract.

#![forbid(unsafe_code)]

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

/// Opaque key/value content of a watched resource.
pub type Payload = BTreeMap<String, String>;

/// Composite `(namespace, name)` key of a watched resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceIdentity {
    pub namespace: String,
    pub name: String,
}

impl ResourceIdentity {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }
}

impl fmt::Display for ResourceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Version token assigned by the authoritative store.
///
/// Tokens are compared for equality to detect change. When both sides are
/// decimal integers (etcd revisions) they can also be ordered, which lets the
/// reconciler reject stale redeliveries; otherwise no ordering is assumed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct ResourceVersion(String);

impl ResourceVersion {
    pub fn new(v: impl Into<String>) -> Self { Self(v.into()) }

    pub fn as_str(&self) -> &str { &self.0 }

    pub fn is_empty(&self) -> bool { self.0.is_empty() }

    pub fn compare(&self, other: &Self) -> Option<Ordering> {
        match (self.0.parse::<u64>(), other.0.parse::<u64>()) {
            (Ok(a), Ok(b)) => Some(a.cmp(&b)),
            _ => None,
        }
    }

    /// True only when both tokens are numeric and `self` is strictly older.
    pub fn is_older_than(&self, other: &Self) -> bool {
        matches!(self.compare(other), Some(Ordering::Less))
    }
}

impl fmt::Display for ResourceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

impl From<&str> for ResourceVersion {
    fn from(v: &str) -> Self { Self(v.to_string()) }
}

impl From<String> for ResourceVersion {
    fn from(v: String) -> Self { Self(v) }
}

/// Point in the source's history a watch resumes from (the list's resource version).
pub type ConsistencyToken = ResourceVersion;

/// Resource state as reported by a change source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceObject {
    pub identity: ResourceIdentity,
    pub version: ResourceVersion,
    pub payload: Payload,
}

impl SourceObject {
    pub fn new(identity: ResourceIdentity, version: impl Into<ResourceVersion>, payload: Payload) -> Self {
        Self { identity, version: version.into(), payload }
    }
}

/// Last known state of one resource, as held by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub identity: ResourceIdentity,
    pub version: ResourceVersion,
    pub payload: Payload,
    pub last_observed_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn observed(obj: SourceObject, at: DateTime<Utc>) -> Self {
        Self { identity: obj.identity, version: obj.version, payload: obj.payload, last_observed_at: at }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransitionKind {
    Added,
    Updated,
    Deleted,
}

impl TransitionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransitionKind::Added => "added",
            TransitionKind::Updated => "updated",
            TransitionKind::Deleted => "deleted",
        }
    }
}

/// One observed lifecycle transition of a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransitionEvent {
    Added(CacheEntry),
    Updated { old: CacheEntry, new: CacheEntry },
    Deleted(CacheEntry),
}

impl TransitionEvent {
    pub fn kind(&self) -> TransitionKind {
        match self {
            TransitionEvent::Added(_) => TransitionKind::Added,
            TransitionEvent::Updated { .. } => TransitionKind::Updated,
            TransitionEvent::Deleted(_) => TransitionKind::Deleted,
        }
    }

    pub fn identity(&self) -> &ResourceIdentity {
        match self {
            TransitionEvent::Added(e) | TransitionEvent::Deleted(e) => &e.identity,
            TransitionEvent::Updated { new, .. } => &new.identity,
        }
    }

    /// State the resource is in after this transition (the removed state for deletions).
    pub fn latest(&self) -> &CacheEntry {
        match self {
            TransitionEvent::Added(e) | TransitionEvent::Deleted(e) => e,
            TransitionEvent::Updated { new, .. } => new,
        }
    }
}

// ---- errors ----

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    /// Connectivity problems, expired watch tokens, throttling. Worth retrying.
    #[error("transient source error: {0}")]
    Transient(String),
    /// Invalid selector or credentials. Retrying will not help.
    #[error("fatal source error: {0}")]
    Fatal(String),
}

impl SourceError {
    pub fn is_transient(&self) -> bool { matches!(self, SourceError::Transient(_)) }
}

pub type SourceResult<T> = Result<T, SourceError>;

/// Failure reported by a registered handler. Isolated by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("handler error: {0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(msg: impl fmt::Display) -> Self { Self(msg.to_string()) }
}

// ---- change source contract ----

/// Full listing of the watched scope plus the token to resume watching from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListPage {
    pub items: Vec<SourceObject>,
    pub token: ConsistencyToken,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Upsert(SourceObject),
    Delete(SourceObject),
    /// Progress marker: advances the resume token, carries no resource state.
    Bookmark(ConsistencyToken),
}

pub type WatchStream = BoxStream<'static, SourceResult<WatchEvent>>;

/// List + watch access to the single resource an engine observes.
///
/// Implementations retry transient failures on their own before giving up
/// with [`SourceError::Transient`]; a watch stream that ends with `None`
/// terminated cleanly and may be resumed from the last seen token.
#[async_trait::async_trait]
pub trait ChangeSource: Send + Sync {
    async fn list(&self, target: &ResourceIdentity) -> SourceResult<ListPage>;

    async fn watch(&self, target: &ResourceIdentity, from: &ConsistencyToken) -> SourceResult<WatchStream>;
}

// ---- retry backoff ----

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub max: Duration,
    pub factor: u32,
    /// Attempts a source makes before surfacing a transient error.
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self { initial: Duration::from_millis(500), max: Duration::from_secs(30), factor: 2, max_attempts: 5 }
    }
}

/// Exponential backoff state: `initial * factor^n`, capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    cfg: BackoffConfig,
    next: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(cfg: BackoffConfig) -> Self { Self { cfg, next: cfg.initial.min(cfg.max), attempts: 0 } }

    pub fn attempts(&self) -> u32 { self.attempts }

    /// Whether another retry is allowed under `max_attempts` (0 means unlimited).
    pub fn exhausted(&self) -> bool { self.cfg.max_attempts != 0 && self.attempts >= self.cfg.max_attempts }

    pub fn next_delay(&mut self) -> Duration {
        let d = self.next;
        self.attempts = self.attempts.saturating_add(1);
        self.next = self.next.saturating_mul(self.cfg.factor.max(1)).min(self.cfg.max);
        d
    }

    pub fn reset(&mut self) {
        self.next = self.cfg.initial.min(self.cfg.max);
        self.attempts = 0;
    }
}

pub mod prelude {
    pub use super::{
        CacheEntry, ChangeSource, ConsistencyToken, HandlerError, ListPage, Payload, ResourceIdentity,
        ResourceVersion, SourceError, SourceObject, SourceResult, TransitionEvent, TransitionKind, WatchEvent,
        WatchStream,
    };
}
