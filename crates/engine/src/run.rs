use std::sync::Arc;

use cmwatch_core::{
    Backoff, ChangeSource, ConsistencyToken, ResourceIdentity, SourceError, TransitionEvent, WatchEvent,
};
use cmwatch_dispatch::Dispatcher;
use cmwatch_store::SyncGate;
use futures::StreamExt;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::reconcile::Reconciler;
use crate::{EngineConfig, EngineCounters, EngineError};

/// The single task that owns the reconciler (and so the store's write side).
pub(crate) struct ReconcileLoop {
    pub(crate) config: EngineConfig,
    pub(crate) source: Arc<dyn ChangeSource>,
    pub(crate) reconciler: Reconciler,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) gate: SyncGate,
    pub(crate) counters: Arc<EngineCounters>,
    pub(crate) cancel: CancellationToken,
}

impl ReconcileLoop {
    /// Drive until cancelled or a fatal source error, then give queued
    /// deliveries up to `drain_timeout` to finish.
    pub(crate) async fn run(self) -> Result<(), EngineError> {
        let Self { config, source, reconciler, dispatcher, gate, counters, cancel } = self;
        let grace = config.drain_timeout;
        let target = config.target.clone();
        let mut driver = Driver { config, source, reconciler, dispatcher: &dispatcher, gate, counters, cancel };
        let res = driver.drive().await;
        let abandoned = dispatcher.shutdown(grace).await;
        if abandoned > 0 {
            warn!(id = %target, lanes = abandoned, "undelivered transitions abandoned at shutdown");
        }
        res
    }
}

struct Driver<'a> {
    config: EngineConfig,
    source: Arc<dyn ChangeSource>,
    reconciler: Reconciler,
    dispatcher: &'a Dispatcher,
    gate: SyncGate,
    counters: Arc<EngineCounters>,
    cancel: CancellationToken,
}

impl Driver<'_> {
    async fn drive(&mut self) -> Result<(), EngineError> {
        let target = self.config.target.clone();
        let period = self.config.resync_interval;
        let mut backoff = Backoff::new(self.config.retry);

        'relist: loop {
            let page = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(()),
                res = self.source.list(&target) => res,
            };
            let page = match page {
                Ok(page) => page,
                Err(SourceError::Transient(msg)) => {
                    warn!(id = %target, error = %msg, attempt = backoff.attempts() + 1, "list failed; keeping cache");
                    if !self.pause(&mut backoff).await {
                        return Ok(());
                    }
                    continue 'relist;
                }
                Err(e) => return Err(e.into()),
            };
            self.counters.lists.inc();
            let events = self.reconciler.apply_list(page.items, &page.token);
            if !self.emit(events).await {
                return Ok(());
            }
            if self.gate.mark_synced() {
                info!(id = %target, entries = self.reconciler.store().len(), rv = %page.token, "initial list merged; cache synced");
            }

            let mut token = page.token;
            let mut resync = tokio::time::interval_at(Instant::now() + period, period);
            resync.set_missed_tick_behavior(MissedTickBehavior::Delay);

            'watch: loop {
                let stream = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return Ok(()),
                    res = self.source.watch(&target, &token) => res,
                };
                let mut stream = match stream {
                    Ok(s) => s,
                    Err(SourceError::Transient(msg)) => {
                        warn!(id = %target, rv = %token, error = %msg, "watch failed to start; will re-list");
                        self.counters.watch_restarts.inc();
                        metrics::counter!("cmwatch_watch_restarts_total", 1u64);
                        if !self.pause(&mut backoff).await {
                            return Ok(());
                        }
                        continue 'relist;
                    }
                    Err(e) => return Err(e.into()),
                };
                debug!(id = %target, rv = %token, "watch established");
                let mut seen_any = false;

                loop {
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => return Ok(()),
                        _ = resync.tick() => self.resync(&target).await?,
                        item = stream.next() => match item {
                            Some(Ok(ev)) => {
                                if !seen_any {
                                    seen_any = true;
                                    backoff.reset();
                                }
                                self.on_watch_event(ev, &mut token).await;
                            }
                            Some(Err(SourceError::Transient(msg))) => {
                                warn!(id = %target, rv = %token, error = %msg, "watch disconnected; keeping cache, will re-list");
                                self.counters.watch_restarts.inc();
                                metrics::counter!("cmwatch_watch_restarts_total", 1u64);
                                if !self.pause(&mut backoff).await {
                                    return Ok(());
                                }
                                continue 'relist;
                            }
                            Some(Err(e)) => return Err(e.into()),
                            None => {
                                debug!(id = %target, rv = %token, "watch stream ended; resuming");
                                if !seen_any && !self.pause(&mut backoff).await {
                                    return Ok(());
                                }
                                continue 'watch;
                            }
                        },
                    }
                }
            }
        }
    }

    async fn on_watch_event(&mut self, ev: WatchEvent, token: &mut ConsistencyToken) {
        match ev {
            WatchEvent::Upsert(obj) => {
                *token = obj.version.clone();
                if let Some(t) = self.reconciler.apply_upsert(obj) {
                    self.emit(vec![t]).await;
                }
            }
            WatchEvent::Delete(obj) => {
                *token = obj.version.clone();
                if let Some(t) = self.reconciler.apply_delete(&obj) {
                    self.emit(vec![t]).await;
                }
            }
            WatchEvent::Bookmark(t) => {
                debug!(rv = %t, "bookmark");
                *token = t;
            }
        }
    }

    /// Periodic full reconciliation. Transient failures keep the cache and
    /// wait for the next tick.
    async fn resync(&mut self, target: &ResourceIdentity) -> Result<(), EngineError> {
        let page = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Ok(()),
            res = self.source.list(target) => res,
        };
        match page {
            Ok(page) => {
                self.counters.resyncs.inc();
                metrics::counter!("cmwatch_resyncs_total", 1u64);
                let events = self.reconciler.apply_list(page.items, &page.token);
                debug!(id = %target, rv = %page.token, transitions = events.len(), "resync merged");
                self.emit(events).await;
                Ok(())
            }
            Err(SourceError::Transient(msg)) => {
                warn!(id = %target, error = %msg, "resync list failed; keeping cache");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Hand transitions to the dispatcher. A full lane blocks here until
    /// there is room or the engine is cancelled; false in the latter case.
    async fn emit(&mut self, events: Vec<TransitionEvent>) -> bool {
        let total = events.len();
        for (i, ev) in events.into_iter().enumerate() {
            info!(id = %ev.identity(), kind = ev.kind().as_str(), rv = %ev.latest().version, "transition");
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    warn!(undispatched = total - i, "cancelled while dispatch lanes were full");
                    return false;
                }
                _ = self.dispatcher.dispatch(ev) => {}
            }
        }
        true
    }

    /// Sleep for the next backoff delay. False when cancelled meanwhile.
    async fn pause(&self, backoff: &mut Backoff) -> bool {
        let delay = backoff.next_delay();
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}
