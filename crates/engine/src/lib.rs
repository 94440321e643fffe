//! cmwatch engine: list/watch reconciliation for one resource, with a local
//! cache, ordered handler dispatch and an initial-sync gate.
//!
//! ```ignore
//! let engine = Engine::new(EngineConfig::new(ResourceIdentity::new("thing", "thing")))
//!     .with_handler(MyHandler);
//! let handle = engine.start(source);
//! if !handle.wait_synced_timeout(Duration::from_secs(60)).await {
//!     anyhow::bail!("failed to sync cache");
//! }
//! // ...
//! handle.stop().await?;
//! ```

#![forbid(unsafe_code)]

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cmwatch_core::{CacheEntry, ChangeSource, ResourceIdentity, SourceError, TransitionKind};
use cmwatch_dispatch::{DispatchStats, Dispatcher, HandlerRegistry};
use cmwatch_store::{ResourceStore, StoreSnapshot, SyncGate};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

mod config;
mod reconcile;
mod run;

pub use cmwatch_dispatch::{DispatchCounts, Handler, HandlerFns};
pub use config::{
    EngineConfig, DEFAULT_DISPATCH_CONCURRENCY, DEFAULT_DRAIN_TIMEOUT, DEFAULT_EVENT_BUFFER, DEFAULT_RESYNC_INTERVAL,
};
pub use reconcile::Reconciler;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The source rejected the selector or credentials; the engine stopped.
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error("engine task failed: {0}")]
    Join(String),
}

#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) { self.0.fetch_add(1, Ordering::Relaxed); }

    pub fn get(&self) -> u64 { self.0.load(Ordering::Relaxed) }
}

/// Running totals kept by the reconciliation loop.
#[derive(Debug, Default)]
pub struct EngineCounters {
    pub added: Counter,
    pub updated: Counter,
    pub deleted: Counter,
    pub deduplicated: Counter,
    pub stale: Counter,
    pub lists: Counter,
    pub resyncs: Counter,
    pub watch_restarts: Counter,
}

impl EngineCounters {
    pub(crate) fn record(&self, kind: TransitionKind) {
        match kind {
            TransitionKind::Added => self.added.inc(),
            TransitionKind::Updated => self.updated.inc(),
            TransitionKind::Deleted => self.deleted.inc(),
        }
        metrics::counter!("cmwatch_transitions_total", 1u64, "kind" => kind.as_str());
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub synced: bool,
    pub entries: usize,
    pub added: u64,
    pub updated: u64,
    pub deleted: u64,
    /// Redeliveries of a version already held.
    pub deduplicated: u64,
    /// Redeliveries of a version older than the one held.
    pub stale: u64,
    /// Successful full lists that began a watch cycle (the first one included).
    pub lists: u64,
    pub resyncs: u64,
    pub watch_restarts: u64,
    pub dispatch: DispatchCounts,
}

/// An engine that has not been started yet.
///
/// Handlers registered here see every transition, the initial list included.
pub struct Engine {
    config: EngineConfig,
    registry: HandlerRegistry,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self { Self { config, registry: HandlerRegistry::new() } }

    pub fn register_handler(&self, handler: impl Handler + 'static) { self.registry.register(Arc::new(handler)); }

    pub fn with_handler(self, handler: impl Handler + 'static) -> Self {
        self.register_handler(handler);
        self
    }

    /// Spawn the reconciliation loop. Must be called from within a tokio runtime.
    pub fn start(self, source: Arc<dyn ChangeSource>) -> EngineHandle {
        self.start_with_cancel(source, CancellationToken::new())
    }

    /// Like [`start`](Self::start), stopping as well when `parent` is cancelled.
    pub fn start_with_cancel(self, source: Arc<dyn ChangeSource>, parent: CancellationToken) -> EngineHandle {
        let Self { config, registry } = self;
        let target = config.target.clone();
        let store = Arc::new(ResourceStore::new());
        let gate = SyncGate::new();
        let counters = Arc::new(EngineCounters::default());
        let cancel = parent.child_token();
        let finished = CancellationToken::new();

        let dispatcher = Dispatcher::spawn(registry.clone(), config.dispatch_concurrency, config.event_buffer);
        let dispatch_stats = dispatcher.stats();
        info!(
            id = %target,
            resync_secs = config.resync_interval.as_secs_f64(),
            dispatch_concurrency = config.dispatch_concurrency,
            handlers = registry.len(),
            "engine starting"
        );

        let lp = run::ReconcileLoop {
            reconciler: reconcile::Reconciler::new(Arc::clone(&store), Arc::clone(&counters)),
            config,
            source,
            dispatcher,
            gate: gate.clone(),
            counters: Arc::clone(&counters),
            cancel: cancel.clone(),
        };
        let task = tokio::spawn({
            let finished = finished.clone();
            let target = target.clone();
            async move {
                let res = lp.run().await;
                match &res {
                    Ok(()) => info!(id = %target, "engine stopped"),
                    Err(e) => error!(id = %target, error = %e, "engine stopped on error"),
                }
                finished.cancel();
                res
            }
        });

        EngineHandle { target, store, gate, registry, counters, dispatch_stats, cancel, finished, task }
    }
}

/// Running engine. Dropping the handle does not stop the engine; call [`stop`](Self::stop).
pub struct EngineHandle {
    target: ResourceIdentity,
    store: Arc<ResourceStore>,
    gate: SyncGate,
    registry: HandlerRegistry,
    counters: Arc<EngineCounters>,
    dispatch_stats: Arc<DispatchStats>,
    cancel: CancellationToken,
    finished: CancellationToken,
    task: JoinHandle<Result<(), EngineError>>,
}

impl EngineHandle {
    pub fn target(&self) -> &ResourceIdentity { &self.target }

    /// Add a handler while running. It sees transitions emitted from now on.
    pub fn register_handler(&self, handler: impl Handler + 'static) { self.registry.register(Arc::new(handler)); }

    pub fn is_synced(&self) -> bool { self.gate.is_synced() }

    /// Wait for the first full list to be merged, `stop` to complete, or the
    /// engine to terminate, whichever happens first. Returns whether synced.
    pub async fn wait_until_synced<F>(&self, stop: F) -> bool
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            synced = self.gate.wait_until_synced(stop) => synced,
            _ = self.finished.cancelled() => self.gate.is_synced(),
        }
    }

    pub async fn wait_synced_timeout(&self, timeout: Duration) -> bool {
        self.wait_until_synced(tokio::time::sleep(timeout)).await
    }

    pub fn get(&self, id: &ResourceIdentity) -> Option<CacheEntry> { self.store.get(id) }

    /// The watched resource's cached state, if it currently exists.
    pub fn current(&self) -> Option<CacheEntry> { self.store.get(&self.target) }

    pub fn snapshot(&self) -> StoreSnapshot { self.store.snapshot() }

    pub fn stats(&self) -> EngineStats {
        let c = &self.counters;
        EngineStats {
            synced: self.gate.is_synced(),
            entries: self.store.len(),
            added: c.added.get(),
            updated: c.updated.get(),
            deleted: c.deleted.get(),
            deduplicated: c.deduplicated.get(),
            stale: c.stale.get(),
            lists: c.lists.get(),
            resyncs: c.resyncs.get(),
            watch_restarts: c.watch_restarts.get(),
            dispatch: self.dispatch_stats.counts(),
        }
    }

    pub fn is_finished(&self) -> bool { self.finished.is_cancelled() }

    /// Resolves once the loop has exited (stopped or failed).
    pub async fn finished(&self) { self.finished.cancelled().await }

    /// Cancel the loop, give queued deliveries up to the configured drain
    /// timeout, and report how it ended.
    pub async fn stop(self) -> Result<(), EngineError> {
        self.cancel.cancel();
        self.join().await
    }

    /// Wait for the loop to exit on its own.
    pub async fn join(self) -> Result<(), EngineError> {
        match self.task.await {
            Ok(res) => res,
            Err(e) => Err(EngineError::Join(e.to_string())),
        }
    }
}
