//! cmwatch dispatch: fan transitions out to registered handlers.
//!
//! Events are routed to a fixed set of lanes by identity. Each lane is one
//! task delivering its queue in order, so one resource never has two
//! deliveries in flight while different resources proceed in parallel, with
//! at most `lanes` handler invocations running at once.

#![forbid(unsafe_code)]

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use cmwatch_core::TransitionEvent;
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

mod handler;
mod lanes;

pub use handler::{Handler, HandlerFns, HandlerRegistry};
pub use lanes::LanePlanner;

#[derive(Debug, Default)]
pub struct DispatchStats {
    delivered: AtomicU64,
    failed: AtomicU64,
    panicked: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchCounts {
    /// Successful handler invocations.
    pub delivered: u64,
    /// Invocations that returned an error.
    pub failed: u64,
    /// Invocations that panicked.
    pub panicked: u64,
}

impl DispatchStats {
    pub fn counts(&self) -> DispatchCounts {
        DispatchCounts {
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            panicked: self.panicked.load(Ordering::Relaxed),
        }
    }
}

pub struct Dispatcher {
    planner: LanePlanner,
    lanes: Vec<mpsc::Sender<TransitionEvent>>,
    workers: Vec<JoinHandle<()>>,
    stats: Arc<DispatchStats>,
}

impl Dispatcher {
    /// Spawn `concurrency` lane workers, each with a queue of `buffer` events.
    /// Must be called from within a tokio runtime.
    pub fn spawn(registry: HandlerRegistry, concurrency: usize, buffer: usize) -> Self {
        let planner = LanePlanner::new(concurrency);
        let stats = Arc::new(DispatchStats::default());
        let mut lanes = Vec::with_capacity(planner.lanes());
        let mut workers = Vec::with_capacity(planner.lanes());
        for lane in 0..planner.lanes() {
            let (tx, mut rx) = mpsc::channel::<TransitionEvent>(buffer.max(1));
            let registry = registry.clone();
            let stats = Arc::clone(&stats);
            workers.push(tokio::spawn(async move {
                while let Some(ev) = rx.recv().await {
                    deliver(&registry, &ev, &stats).await;
                }
                debug!(lane, "dispatch lane drained");
            }));
            lanes.push(tx);
        }
        Self { planner, lanes, workers, stats }
    }

    pub fn stats(&self) -> Arc<DispatchStats> { Arc::clone(&self.stats) }

    /// Queue an event on its identity's lane, waiting for room if the lane is full.
    /// Returns false if the lane worker is gone.
    pub async fn dispatch(&self, ev: TransitionEvent) -> bool {
        let lane = self.planner.lane(ev.identity());
        match self.lanes[lane].send(ev).await {
            Ok(()) => true,
            Err(mpsc::error::SendError(ev)) => {
                error!(lane, id = %ev.identity(), kind = ev.kind().as_str(), "dispatch lane closed; event dropped");
                false
            }
        }
    }

    /// Close the lanes and let queued events drain for up to `grace`. Lanes
    /// still busy after that are aborted along with whatever they hold.
    /// Returns how many lanes were abandoned.
    pub async fn shutdown(self, grace: Duration) -> usize {
        let Self { lanes, workers, .. } = self;
        drop(lanes);
        let deadline = tokio::time::Instant::now() + grace;
        let mut abandoned = 0;
        for (lane, mut w) in workers.into_iter().enumerate() {
            match tokio::time::timeout_at(deadline, &mut w).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(lane, error = %e, "dispatch lane ended abnormally"),
                Err(_) => {
                    w.abort();
                    abandoned += 1;
                    warn!(lane, grace_ms = grace.as_millis() as u64, "dispatch lane still busy; abandoned");
                }
            }
        }
        abandoned
    }
}

async fn deliver(registry: &HandlerRegistry, ev: &TransitionEvent, stats: &DispatchStats) {
    let started = Instant::now();
    let handlers = registry.current();
    for h in handlers.iter() {
        let call = match ev {
            TransitionEvent::Added(e) => h.on_added(e),
            TransitionEvent::Updated { old, new } => h.on_updated(old, new),
            TransitionEvent::Deleted(e) => h.on_deleted(e),
        };
        match AssertUnwindSafe(call).catch_unwind().await {
            Ok(Ok(())) => {
                stats.delivered.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Err(e)) => {
                stats.failed.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("cmwatch_handler_errors_total", 1u64, "handler" => h.name().to_string());
                warn!(handler = %h.name(), id = %ev.identity(), kind = ev.kind().as_str(), error = %e, "handler failed");
            }
            Err(_) => {
                stats.panicked.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("cmwatch_handler_panics_total", 1u64, "handler" => h.name().to_string());
                error!(handler = %h.name(), id = %ev.identity(), kind = ev.kind().as_str(), "handler panicked");
            }
        }
    }
    metrics::histogram!("cmwatch_dispatch_ms", started.elapsed().as_secs_f64() * 1_000.0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use cmwatch_core::{CacheEntry, HandlerError, Payload, ResourceIdentity, SourceObject};
    use std::sync::Mutex;

    const GRACE: Duration = Duration::from_secs(5);

    fn entry(name: &str, rv: &str) -> CacheEntry {
        CacheEntry::observed(SourceObject::new(ResourceIdentity::new("ns", name), rv, Payload::new()), Utc::now())
    }

    type Log = Arc<Mutex<Vec<String>>>;

    fn recorder(name: &str, log: Log) -> HandlerFns {
        let (a, u, d) = (log.clone(), log.clone(), log);
        HandlerFns::new(name)
            .on_added(move |e| {
                a.lock().unwrap().push(format!("+{}@{}", e.identity.name, e.version));
                Ok(())
            })
            .on_updated(move |_, n| {
                u.lock().unwrap().push(format!("~{}@{}", n.identity.name, n.version));
                Ok(())
            })
            .on_deleted(move |e| {
                d.lock().unwrap().push(format!("-{}@{}", e.identity.name, e.version));
                Ok(())
            })
    }

    struct Failing;

    #[async_trait::async_trait]
    impl Handler for Failing {
        fn name(&self) -> &str { "failing" }

        async fn on_added(&self, _entry: &CacheEntry) -> Result<(), HandlerError> { Err(HandlerError::new("nope")) }
    }

    struct Panicking;

    #[async_trait::async_trait]
    impl Handler for Panicking {
        async fn on_added(&self, _entry: &CacheEntry) -> Result<(), HandlerError> { panic!("handler bug") }
    }

    struct Stuck;

    #[async_trait::async_trait]
    impl Handler for Stuck {
        async fn on_added(&self, _entry: &CacheEntry) -> Result<(), HandlerError> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn per_identity_order_is_preserved_across_lanes() {
        let log: Log = Arc::default();
        let registry = HandlerRegistry::new();
        registry.register(Arc::new(recorder("rec", log.clone())));
        let d = Dispatcher::spawn(registry, 4, 16);
        for name in ["a", "b", "c"] {
            d.dispatch(TransitionEvent::Added(entry(name, "1"))).await;
            d.dispatch(TransitionEvent::Updated { old: entry(name, "1"), new: entry(name, "2") }).await;
            d.dispatch(TransitionEvent::Deleted(entry(name, "2"))).await;
        }
        d.shutdown(GRACE).await;
        let log = log.lock().unwrap().clone();
        assert_eq!(log.len(), 9);
        for name in ["a", "b", "c"] {
            let mine: Vec<_> = log.iter().filter(|l| l[1..].starts_with(name)).cloned().collect();
            assert_eq!(mine, vec![format!("+{name}@1"), format!("~{name}@2"), format!("-{name}@2")]);
        }
    }

    #[tokio::test]
    async fn failing_and_panicking_handlers_are_isolated() {
        let log: Log = Arc::default();
        let registry = HandlerRegistry::new();
        registry.register(Arc::new(Failing));
        registry.register(Arc::new(Panicking));
        registry.register(Arc::new(recorder("rec", log.clone())));
        let d = Dispatcher::spawn(registry, 1, 8);
        let stats = d.stats();
        d.dispatch(TransitionEvent::Added(entry("a", "1"))).await;
        d.dispatch(TransitionEvent::Added(entry("b", "1"))).await;
        d.shutdown(GRACE).await;
        assert_eq!(*log.lock().unwrap(), vec!["+a@1".to_string(), "+b@1".to_string()]);
        let c = stats.counts();
        assert_eq!(c.failed, 2);
        assert_eq!(c.panicked, 2);
        assert_eq!(c.delivered, 2);
    }

    #[tokio::test]
    async fn handlers_registered_later_see_later_events() {
        let early: Log = Arc::default();
        let late: Log = Arc::default();
        let registry = HandlerRegistry::new();
        registry.register(Arc::new(recorder("early", early.clone())));
        let d = Dispatcher::spawn(registry.clone(), 1, 8);
        d.dispatch(TransitionEvent::Added(entry("a", "1"))).await;
        // let the first delivery finish before the second handler joins
        tokio::time::sleep(Duration::from_millis(20)).await;
        registry.register(Arc::new(recorder("late", late.clone())));
        d.dispatch(TransitionEvent::Deleted(entry("a", "1"))).await;
        d.shutdown(GRACE).await;
        assert_eq!(early.lock().unwrap().len(), 2);
        assert_eq!(*late.lock().unwrap(), vec!["-a@1".to_string()]);
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn unset_callbacks_are_noops() {
        let registry = HandlerRegistry::new();
        registry.register(Arc::new(HandlerFns::new("empty")));
        let d = Dispatcher::spawn(registry, 2, 4);
        let stats = d.stats();
        assert!(d.dispatch(TransitionEvent::Deleted(entry("a", "1"))).await);
        d.shutdown(GRACE).await;
        assert_eq!(stats.counts(), DispatchCounts { delivered: 1, failed: 0, panicked: 0 });
    }

    #[tokio::test]
    async fn shutdown_abandons_lanes_stuck_past_grace() {
        let log: Log = Arc::default();
        let registry = HandlerRegistry::new();
        registry.register(Arc::new(Stuck));
        registry.register(Arc::new(recorder("rec", log.clone())));
        let d = Dispatcher::spawn(registry, 1, 8);
        d.dispatch(TransitionEvent::Added(entry("a", "1"))).await;
        d.dispatch(TransitionEvent::Added(entry("b", "1"))).await;
        let abandoned = tokio::time::timeout(Duration::from_secs(3), d.shutdown(Duration::from_millis(50)))
            .await
            .expect("shutdown is bounded by its grace period");
        assert_eq!(abandoned, 1);
        assert!(log.lock().unwrap().is_empty());
    }
}
