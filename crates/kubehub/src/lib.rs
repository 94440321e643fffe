//! cmwatch kubehub: list+watch of a single ConfigMap through kube, exposed as a
//! [`ChangeSource`].

#![forbid(unsafe_code)]

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use cmwatch_core::{
    Backoff, BackoffConfig, ChangeSource, ConsistencyToken, ListPage, Payload, ResourceIdentity, SourceError,
    SourceObject, SourceResult, WatchEvent, WatchStream,
};
use futures::StreamExt;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::{
    api::{Api, ListParams, WatchEvent as KubeWatchEvent, WatchParams},
    config::{KubeConfigOptions, Kubeconfig},
    core::ErrorResponse,
    Client, Config,
};
use tracing::{debug, info, warn};

/// Server-side watch timeout; the apiserver rejects values of 295s and above.
const WATCH_TIMEOUT_SECS: u32 = 290;

/// Build a client from an explicit kubeconfig path, or infer one
/// (in-cluster service account, then `$KUBECONFIG` / `~/.kube/config`).
pub async fn client_for(kubeconfig: Option<&Path>) -> Result<Client> {
    match kubeconfig {
        Some(path) => {
            let kc = Kubeconfig::read_from(path).with_context(|| format!("reading kubeconfig {}", path.display()))?;
            let cfg = Config::from_custom_kubeconfig(kc, &KubeConfigOptions::default())
                .await
                .context("loading kubeconfig")?;
            info!(cluster = %cfg.cluster_url, "using kubeconfig {}", path.display());
            Client::try_from(cfg).context("building kube client")
        }
        None => Client::try_default().await.context("inferring kube client config"),
    }
}

/// Retry settings for list and watch calls. `CMWATCH_WATCH_BACKOFF_MAX_SECS`
/// caps the delay between attempts.
pub fn backoff_from_env() -> BackoffConfig {
    let mut cfg = BackoffConfig::default();
    if let Some(secs) = std::env::var("CMWATCH_WATCH_BACKOFF_MAX_SECS").ok().and_then(|s| s.parse::<u64>().ok()) {
        cfg.max = Duration::from_secs(secs.max(1));
    }
    cfg
}

/// Field selector restricting a ConfigMap list/watch to one name.
pub fn name_selector(name: &str) -> String { format!("metadata.name={name}") }

/// Sort a kube error into retry-worthy or not.
pub fn classify(err: &kube::Error) -> SourceError {
    match err {
        kube::Error::Api(resp) => classify_response(resp),
        kube::Error::Auth(e) => SourceError::Fatal(format!("auth: {e}")),
        other => SourceError::Transient(other.to_string()),
    }
}

pub fn classify_response(resp: &ErrorResponse) -> SourceError {
    classify_status(resp.code, &resp.message)
}

/// 410 (expired token), 408, 429 and 5xx are transient; other 4xx mean the
/// selector, namespace or credentials are wrong.
pub fn classify_status(code: u16, message: &str) -> SourceError {
    let msg = format!("{code}: {message}");
    match code {
        408 | 410 | 429 => SourceError::Transient(msg),
        500..=599 => SourceError::Transient(msg),
        400..=499 => SourceError::Fatal(msg),
        _ => SourceError::Transient(msg),
    }
}

fn is_gone(err: &kube::Error) -> bool { matches!(err, kube::Error::Api(resp) if resp.code == 410) }

/// Shape a ConfigMap into the engine's view. String data is kept as is;
/// binary keys are summarized by size. Objects without a name or resource
/// version are not usable and yield `None`.
pub fn to_source_object(cm: &ConfigMap, default_ns: &str) -> Option<SourceObject> {
    let name = cm.metadata.name.as_deref()?;
    let rv = cm.metadata.resource_version.as_deref()?;
    let ns = cm.metadata.namespace.as_deref().unwrap_or(default_ns);
    let mut payload: Payload = cm.data.clone().unwrap_or_default();
    if let Some(bin) = &cm.binary_data {
        for (k, v) in bin {
            payload.insert(k.clone(), format!("<binary {} bytes>", v.0.len()));
        }
    }
    Some(SourceObject::new(ResourceIdentity::new(ns, name), rv, payload))
}

fn translate(item: kube::Result<KubeWatchEvent<ConfigMap>>, ns: &str) -> Option<SourceResult<WatchEvent>> {
    match item {
        Ok(KubeWatchEvent::Added(cm)) | Ok(KubeWatchEvent::Modified(cm)) => match to_source_object(&cm, ns) {
            Some(obj) => Some(Ok(WatchEvent::Upsert(obj))),
            None => {
                warn!(ns, "watch event without name or resourceVersion skipped");
                None
            }
        },
        Ok(KubeWatchEvent::Deleted(cm)) => to_source_object(&cm, ns).map(|obj| Ok(WatchEvent::Delete(obj))),
        Ok(KubeWatchEvent::Bookmark(bm)) => {
            Some(Ok(WatchEvent::Bookmark(ConsistencyToken::new(bm.metadata.resource_version))))
        }
        Ok(KubeWatchEvent::Error(resp)) => Some(Err(classify_response(&resp))),
        Err(e) => Some(Err(classify(&e))),
    }
}

/// [`ChangeSource`] over the ConfigMaps API, narrowed to the target's name.
pub struct KubeConfigMapSource {
    client: Client,
    backoff: BackoffConfig,
}

impl KubeConfigMapSource {
    pub fn new(client: Client) -> Self {
        Self { client, backoff: BackoffConfig::default() }
    }

    pub async fn connect(kubeconfig: Option<&Path>) -> Result<Self> { Ok(Self::new(client_for(kubeconfig).await?)) }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    fn api(&self, ns: &str) -> Api<ConfigMap> { Api::namespaced(self.client.clone(), ns) }

    /// Run `call` until it succeeds, fails permanently, or the backoff is
    /// exhausted. An expired token (410) is returned at once: only a fresh
    /// list can fix it.
    async fn with_retry<T, F, Fut>(&self, op: &'static str, target: &ResourceIdentity, mut call: F) -> SourceResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = kube::Result<T>>,
    {
        let mut backoff = Backoff::new(self.backoff);
        loop {
            let err = match call().await {
                Ok(v) => return Ok(v),
                Err(e) => e,
            };
            let classified = classify(&err);
            if !classified.is_transient() || is_gone(&err) || backoff.exhausted() {
                warn!(op, id = %target, error = %err, attempts = backoff.attempts() + 1, "giving up");
                return Err(classified);
            }
            let delay = backoff.next_delay();
            metrics::counter!("cmwatch_source_retries_total", 1u64, "op" => op);
            warn!(op, id = %target, error = %err, attempt = backoff.attempts(), delay_ms = delay.as_millis() as u64, "retrying");
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait::async_trait]
impl ChangeSource for KubeConfigMapSource {
    async fn list(&self, target: &ResourceIdentity) -> SourceResult<ListPage> {
        let api = self.api(&target.namespace);
        let lp = ListParams::default().fields(&name_selector(&target.name));
        let list = self.with_retry("list", target, || api.list(&lp)).await?;
        let token = ConsistencyToken::new(list.metadata.resource_version.clone().unwrap_or_default());
        let items: Vec<SourceObject> =
            list.items.iter().filter_map(|cm| to_source_object(cm, &target.namespace)).collect();
        debug!(id = %target, count = items.len(), rv = %token, "listed");
        Ok(ListPage { items, token })
    }

    async fn watch(&self, target: &ResourceIdentity, from: &ConsistencyToken) -> SourceResult<WatchStream> {
        let api = self.api(&target.namespace);
        let wp = WatchParams::default().fields(&name_selector(&target.name)).timeout(WATCH_TIMEOUT_SECS);
        let stream = self.with_retry("watch", target, || api.watch(&wp, from.as_str())).await?;
        info!(id = %target, rv = %from, "watch started");
        let ns = target.namespace.clone();
        Ok(stream.filter_map(move |item| futures::future::ready(translate(item, &ns))).boxed())
    }
}
