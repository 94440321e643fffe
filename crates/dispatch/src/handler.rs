use std::sync::Arc;

use arc_swap::ArcSwap;
use cmwatch_core::{CacheEntry, HandlerError};

/// Capability set a consumer implements to observe transitions.
///
/// Every callback is optional; the defaults do nothing. Callbacks receive
/// copies of the stored entries.
#[async_trait::async_trait]
pub trait Handler: Send + Sync {
    /// Label used in logs and metrics.
    fn name(&self) -> &str { std::any::type_name::<Self>() }

    async fn on_added(&self, _entry: &CacheEntry) -> Result<(), HandlerError> { Ok(()) }

    async fn on_updated(&self, _old: &CacheEntry, _new: &CacheEntry) -> Result<(), HandlerError> { Ok(()) }

    async fn on_deleted(&self, _entry: &CacheEntry) -> Result<(), HandlerError> { Ok(()) }
}

type EntryFn = Box<dyn Fn(&CacheEntry) -> Result<(), HandlerError> + Send + Sync>;
type UpdateFn = Box<dyn Fn(&CacheEntry, &CacheEntry) -> Result<(), HandlerError> + Send + Sync>;

/// Closure-backed [`Handler`]; unset callbacks are no-ops.
pub struct HandlerFns {
    name: String,
    added: Option<EntryFn>,
    updated: Option<UpdateFn>,
    deleted: Option<EntryFn>,
}

impl HandlerFns {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), added: None, updated: None, deleted: None }
    }

    pub fn on_added<F>(mut self, f: F) -> Self
    where
        F: Fn(&CacheEntry) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.added = Some(Box::new(f));
        self
    }

    pub fn on_updated<F>(mut self, f: F) -> Self
    where
        F: Fn(&CacheEntry, &CacheEntry) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.updated = Some(Box::new(f));
        self
    }

    pub fn on_deleted<F>(mut self, f: F) -> Self
    where
        F: Fn(&CacheEntry) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.deleted = Some(Box::new(f));
        self
    }
}

#[async_trait::async_trait]
impl Handler for HandlerFns {
    fn name(&self) -> &str { &self.name }

    async fn on_added(&self, entry: &CacheEntry) -> Result<(), HandlerError> {
        self.added.as_ref().map_or(Ok(()), |f| f(entry))
    }

    async fn on_updated(&self, old: &CacheEntry, new: &CacheEntry) -> Result<(), HandlerError> {
        self.updated.as_ref().map_or(Ok(()), |f| f(old, new))
    }

    async fn on_deleted(&self, entry: &CacheEntry) -> Result<(), HandlerError> {
        self.deleted.as_ref().map_or(Ok(()), |f| f(entry))
    }
}

/// Shared, append-only list of handlers.
///
/// Registration swaps in a new list, so a delivery in flight keeps iterating
/// the list it loaded and new handlers see the next event onward.
#[derive(Clone)]
pub struct HandlerRegistry {
    handlers: Arc<ArcSwap<Vec<Arc<dyn Handler>>>>,
}

impl Default for HandlerRegistry {
    fn default() -> Self { Self::new() }
}

impl HandlerRegistry {
    pub fn new() -> Self { Self { handlers: Arc::new(ArcSwap::from_pointee(Vec::new())) } }

    pub fn register(&self, handler: Arc<dyn Handler>) {
        self.handlers.rcu(|cur| {
            let mut next: Vec<Arc<dyn Handler>> = cur.as_ref().clone();
            next.push(Arc::clone(&handler));
            next
        });
        tracing::debug!(handler = %handler.name(), total = self.len(), "handler registered");
    }

    pub fn len(&self) -> usize { self.handlers.load().len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn current(&self) -> Arc<Vec<Arc<dyn Handler>>> { self.handlers.load_full() }
}
