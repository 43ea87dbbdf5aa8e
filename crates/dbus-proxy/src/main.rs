mod cli;
mod config;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use audit_log::{AuditEntry, AuditEventType, AuditSink, AuditSource};
use bus_relay::control::{self, ControlSource};
use bus_relay::{Proxy, ProxyConfig};
use clap::Parser;
use policy_engine::{loader, PolicyStore};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use crate::cli::Cli;
use crate::config::{LogFormat, Settings};

fn main() -> Result<()> {
    let cli = Cli::parse();
    let runtime = tokio::runtime::Runtime::new().context("failed to start async runtime")?;
    let result = runtime.block_on(run(cli));
    // A stdin control reader sits on a blocking thread that cannot be interrupted.
    runtime.shutdown_timeout(Duration::from_secs(1));
    result
}

async fn run(cli: Cli) -> Result<()> {
    let loaded = config::load(&cli.settings)?;
    let settings_found = loaded.is_some();
    let mut settings = loaded.unwrap_or_default();
    settings.apply_cli(&cli);

    init_tracing(&settings);
    if !settings_found {
        tracing::warn!(path = %cli.settings.display(), "settings file not found, using defaults");
    }

    let (audit, audit_handle) = match &settings.logging.audit_log_path {
        Some(path) => {
            let (sink, handle) = AuditSink::start(path)
                .await
                .with_context(|| format!("failed to open audit log {}", path.display()))?;
            (sink, Some(handle))
        }
        None => (AuditSink::disabled(), None),
    };

    let outside = config::resolve_outside(settings.outside_address.as_deref(), cli.bus, |key| {
        std::env::var(key).ok()
    })?;

    let store = Arc::new(PolicyStore::new());
    if let Some(path) = &cli.config {
        let policy = loader::load_policy(path)
            .with_context(|| format!("failed to load initial policy {}", path.display()))?;
        store.replace(policy);
        tracing::info!(path = %path.display(), "initial policy loaded");
    }

    let proxy = Proxy::bind(
        ProxyConfig {
            inside_path: cli.inside_socket.clone(),
            outside,
            session: settings.session_config(cli.bus),
        },
        store.reader(),
        audit.clone(),
    )
    .with_context(|| format!("failed to bind {}", cli.inside_socket.display()))?;

    audit
        .log(AuditEntry::new(
            AuditEventType::ProxyStarted,
            AuditSource::new("dbus-proxy"),
            serde_json::json!({
                "version": env!("CARGO_PKG_VERSION"),
                "bus": cli.bus.as_str(),
                "inside": proxy.inside_path().display().to_string(),
            }),
        ))
        .await;

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            wait_for_signal().await;
            shutdown.cancel();
        }
    });

    let source = match &cli.control {
        Some(path) => ControlSource::Fifo(path.clone()),
        None => ControlSource::Stdin,
    };
    let control_task = tokio::spawn({
        let store = Arc::clone(&store);
        let audit = audit.clone();
        let cancel = shutdown.clone();
        async move { control::serve(source, &store, &audit, &cancel).await }
    });

    let result = proxy.run(shutdown.clone()).await.context("proxy listener failed");
    shutdown.cancel();
    control_task.abort();
    let _ = control_task.await;

    audit
        .log(AuditEntry::new(
            AuditEventType::ProxyStopped,
            AuditSource::new("dbus-proxy"),
            serde_json::json!({ "dropped_audit_entries": audit.dropped() }),
        ))
        .await;
    drop(audit);
    if let Some(handle) = audit_handle {
        let _ = handle.await;
    }

    tracing::info!("dbus-proxy stopped");
    result
}

fn init_tracing(settings: &Settings) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr);

    match settings.logging.format {
        LogFormat::Json => builder.json().with_thread_ids(true).init(),
        LogFormat::Text => builder.init(),
    }
}

async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => tracing::info!("received SIGINT, shutting down"),
                _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
            }
        }
        Err(err) => {
            tracing::warn!(%err, "cannot install SIGTERM handler, waiting for SIGINT only");
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("received SIGINT, shutting down");
        }
    }
}
