use cmwatch_core::{CacheEntry, HandlerError, TransitionEvent};
use cmwatch_engine::Handler;
use tracing::info;

use crate::Output;

/// Longest value printed per key before truncation.
pub const MAX_VALUE_CHARS: usize = 100;

/// Cut `v` to at most `max` characters, marking the cut with `...`.
pub fn truncate_value(v: &str, max: usize) -> String {
    match v.char_indices().nth(max) {
        Some((cut, _)) => format!("{}...", &v[..cut]),
        None => v.to_string(),
    }
}

/// Logs every transition of the watched ConfigMap.
pub struct LogHandler {
    output: Output,
}

impl LogHandler {
    pub fn new(output: Output) -> Self { Self { output } }

    fn log_entry(&self, what: &str, entry: &CacheEntry) {
        info!(id = %entry.identity, rv = %entry.version, keys = entry.payload.len(), "{what}");
        for (k, v) in &entry.payload {
            info!(id = %entry.identity, key = %k, value = %truncate_value(v, MAX_VALUE_CHARS), "data");
        }
    }

    fn print_json(&self, ev: &TransitionEvent) -> Result<(), HandlerError> {
        let line = serde_json::to_string(ev).map_err(HandlerError::new)?;
        println!("{line}");
        Ok(())
    }
}

#[async_trait::async_trait]
impl Handler for LogHandler {
    fn name(&self) -> &str { "log" }

    async fn on_added(&self, entry: &CacheEntry) -> Result<(), HandlerError> {
        match self.output {
            Output::Human => {
                self.log_entry("configmap added", entry);
                Ok(())
            }
            Output::Json => self.print_json(&TransitionEvent::Added(entry.clone())),
        }
    }

    async fn on_updated(&self, old: &CacheEntry, new: &CacheEntry) -> Result<(), HandlerError> {
        match self.output {
            Output::Human => {
                info!(id = %new.identity, from = %old.version, to = %new.version, "configmap updated");
                self.log_entry("current data", new);
                Ok(())
            }
            Output::Json => self.print_json(&TransitionEvent::Updated { old: old.clone(), new: new.clone() }),
        }
    }

    async fn on_deleted(&self, entry: &CacheEntry) -> Result<(), HandlerError> {
        match self.output {
            Output::Human => {
                info!(id = %entry.identity, rv = %entry.version, "configmap deleted");
                Ok(())
            }
            Output::Json => self.print_json(&TransitionEvent::Deleted(entry.clone())),
        }
    }
}
