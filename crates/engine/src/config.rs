use std::time::Duration;

use anyhow::{Context, Result};
use cmwatch_core::{BackoffConfig, ResourceIdentity};
use serde::Serialize;

pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_DISPATCH_CONCURRENCY: usize = 4;
pub const DEFAULT_EVENT_BUFFER: usize = 1024;
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Runtime options of one engine instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineConfig {
    /// The single resource this engine observes.
    pub target: ResourceIdentity,
    /// Period between forced full reconciliations.
    pub resync_interval: Duration,
    /// Maximum handler invocations running at once (at least 1).
    pub dispatch_concurrency: usize,
    /// Queue depth per dispatch lane.
    pub event_buffer: usize,
    /// Pause between attempts when the source reports a transient failure.
    pub retry: BackoffConfig,
    /// How long `stop` lets queued deliveries finish before abandoning them.
    pub drain_timeout: Duration,
}

impl EngineConfig {
    pub fn new(target: ResourceIdentity) -> Self {
        Self {
            target,
            resync_interval: DEFAULT_RESYNC_INTERVAL,
            dispatch_concurrency: DEFAULT_DISPATCH_CONCURRENCY,
            event_buffer: DEFAULT_EVENT_BUFFER,
            retry: BackoffConfig { max_attempts: 0, ..BackoffConfig::default() },
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }

    /// Defaults overridden by `CMWATCH_RESYNC_SECS`, `CMWATCH_DISPATCH_CONCURRENCY`,
    /// `CMWATCH_EVENT_BUFFER` and `CMWATCH_DRAIN_SECS` when set.
    pub fn from_env(target: ResourceIdentity) -> Result<Self> {
        let mut cfg = Self::new(target);
        if let Some(secs) = env_parse::<u64>("CMWATCH_RESYNC_SECS")? {
            anyhow::ensure!(secs > 0, "CMWATCH_RESYNC_SECS must be at least 1");
            cfg = cfg.with_resync_interval(Duration::from_secs(secs));
        }
        if let Some(secs) = env_parse::<u64>("CMWATCH_DRAIN_SECS")? {
            cfg = cfg.with_drain_timeout(Duration::from_secs(secs));
        }
        if let Some(n) = env_parse::<usize>("CMWATCH_DISPATCH_CONCURRENCY")? {
            cfg = cfg.with_dispatch_concurrency(n);
        }
        if let Some(n) = env_parse::<usize>("CMWATCH_EVENT_BUFFER")? {
            cfg = cfg.with_event_buffer(n);
        }
        Ok(cfg)
    }

    pub fn with_resync_interval(mut self, every: Duration) -> Self {
        // tokio intervals panic on a zero period
        self.resync_interval = every.max(Duration::from_millis(1));
        self
    }

    pub fn with_dispatch_concurrency(mut self, n: usize) -> Self {
        self.dispatch_concurrency = n.max(1);
        self
    }

    pub fn with_event_buffer(mut self, n: usize) -> Self {
        self.event_buffer = n.max(1);
        self
    }

    pub fn with_retry(mut self, retry: BackoffConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_drain_timeout(mut self, grace: Duration) -> Self {
        self.drain_timeout = grace;
        self
    }
}

fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse::<T>().map(Some).with_context(|| format!("parsing {key}={raw}")),
        Err(_) => Ok(None),
    }
}
