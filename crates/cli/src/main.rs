use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Parser, ValueEnum};
use cmwatch_core::ResourceIdentity;
use cmwatch_engine::{Engine, EngineConfig};
use cmwatch_kubehub::KubeConfigMapSource;
use tokio::signal;
use tracing::{error, info, warn};

mod handler;

use handler::LogHandler;

#[derive(Parser, Debug)]
#[command(name = "cmwatch", version, about = "Watch a ConfigMap and log its transitions")]
struct Cli {
    /// Path to a kubeconfig (default: in-cluster, then ~/.kube/config)
    #[arg(long, env = "CMWATCH_KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Namespace of the ConfigMap
    #[arg(long, env = "CMWATCH_NAMESPACE", default_value = "thing")]
    namespace: String,

    /// Name of the ConfigMap
    #[arg(long, env = "CMWATCH_CONFIGMAP", default_value = "thing")]
    configmap: String,

    /// Seconds between full re-lists
    #[arg(long, env = "CMWATCH_RESYNC_SECS", default_value_t = 30, value_parser = clap::value_parser!(u64).range(1..))]
    resync_secs: u64,

    /// Handler invocations allowed to run at once
    #[arg(long, env = "CMWATCH_DISPATCH_CONCURRENCY", default_value_t = 4)]
    dispatch_concurrency: usize,

    /// Give up if the first list is not merged within this many seconds
    #[arg(long, env = "CMWATCH_SYNC_TIMEOUT_SECS", default_value_t = 60)]
    sync_timeout_secs: u64,

    /// Output format for transitions
    #[arg(short = 'o', long = "output", value_enum, env = "CMWATCH_OUTPUT", default_value_t = Output::Human)]
    output: Output,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum Output {
    Human,
    Json,
}

fn init_tracing() {
    let env = std::env::var("CMWATCH_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("CMWATCH_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid CMWATCH_METRICS_ADDR; expected host:port");
        }
    }
}

/// Resolves on SIGINT, or SIGTERM on unix.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut term = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM; Ctrl-C only");
                let _ = signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = signal::ctrl_c() => info!("SIGINT received"),
            _ = term.recv() => info!("SIGTERM received"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = signal::ctrl_c().await;
        info!("Ctrl-C received");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let target = ResourceIdentity::new(cli.namespace.clone(), cli.configmap.clone());
    let config = EngineConfig::from_env(target)?
        .with_resync_interval(Duration::from_secs(cli.resync_secs))
        .with_dispatch_concurrency(cli.dispatch_concurrency);
    info!(config = %serde_json::to_string(&config)?, "starting");

    let source = KubeConfigMapSource::connect(cli.kubeconfig.as_deref())
        .await?
        .with_backoff(cmwatch_kubehub::backoff_from_env());
    let handle = Engine::new(config).with_handler(LogHandler::new(cli.output)).start(Arc::new(source));

    if !handle.wait_synced_timeout(Duration::from_secs(cli.sync_timeout_secs)).await {
        let stopped = handle.stop().await;
        if let Err(e) = stopped {
            error!(error = %e, "engine stopped before sync");
        }
        bail!("failed to sync cache");
    }
    info!(id = %handle.target(), "cache synced");

    tokio::select! {
        _ = shutdown_signal() => {}
        _ = handle.finished() => warn!("engine exited on its own"),
    }

    let stats = handle.stats();
    match handle.stop().await {
        Ok(()) => {
            info!(stats = %serde_json::to_string(&stats)?, "stopped");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "engine failed");
            Err(e.into())
        }
    }
}
