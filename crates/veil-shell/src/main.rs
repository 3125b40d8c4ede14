//! Veil Shell
//!
//! Runs the shell core behind a newline-delimited JSON bridge on stdio.
//! The embedding host writes requests, transfer events and presentation
//! commands to stdin and reads verdicts and events from stdout.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;

use veil_core::config::{self, Config};
use veil_shell::Shell;
use veil_shell::bridge::HostBridge;

#[derive(Parser, Debug)]
#[command(name = "veil-shell")]
#[command(version, about = "Veil browser shell core")]
struct Args {
    /// Extra config file applied over the global and project files.
    #[arg(long, env = "VEIL_CONFIG")]
    config: Option<PathBuf>,

    /// Project directory holding `.veil/settings.json`.
    #[arg(long, env = "VEIL_PROJECT_DIR")]
    project_dir: Option<PathBuf>,

    /// Directory downloads are saved into.
    #[arg(long)]
    downloads_dir: Option<PathBuf>,

    /// Permission preference file.
    #[arg(long)]
    permissions_file: Option<PathBuf>,

    /// Seconds to wait for a permission answer before denying.
    #[arg(long)]
    prompt_timeout: Option<u64>,

    /// Disable the built-in request filter.
    #[arg(long)]
    no_filter: bool,

    /// Log level filter (e.g. "info", "debug", "warn").
    #[arg(long, env = "VEIL_LOG_LEVEL")]
    log_level: Option<String>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "VEIL_LOG_JSON")]
    log_json: bool,

    /// OpenTelemetry OTLP endpoint for traces and metrics export
    /// (e.g. `http://localhost:4317`). Requires the `metrics` feature.
    #[cfg(feature = "metrics")]
    #[arg(long, env = "VEIL_METRICS_ENDPOINT")]
    metrics_endpoint: Option<String>,
}

impl Args {
    fn resolve_config(&self) -> anyhow::Result<Config> {
        let mut config = config::load_config(self.project_dir.as_deref())?;
        if let Some(path) = &self.config {
            config::merge_config(&mut config, config::load_config_file(path)?);
        }
        if let Some(dir) = &self.downloads_dir {
            config.downloads.directory = Some(dir.clone());
        }
        if let Some(path) = &self.permissions_file {
            config.permissions.store_path = Some(path.clone());
        }
        if let Some(secs) = self.prompt_timeout {
            config.permissions.prompt_timeout_secs = secs;
        }
        if self.no_filter {
            config.filters.enabled = false;
        }
        if let Some(level) = &self.log_level {
            config.shell.log_level.clone_from(level);
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = args.resolve_config()?;

    #[cfg(feature = "metrics")]
    let metrics_endpoint = args.metrics_endpoint.as_deref();
    #[cfg(not(feature = "metrics"))]
    let metrics_endpoint: Option<&str> = None;

    // Hold the guard so the OTel pipeline stays alive for the process lifetime.
    let log_filter = format!(
        "veil_shell={level},veil_core={level}",
        level = config.shell.log_level
    );
    let metrics_guard = veil_core::tracing_init::init_tracing_with_metrics(
        &log_filter,
        args.log_json,
        metrics_endpoint,
    );

    info!(
        version = env!("CARGO_PKG_VERSION"),
        filter_enabled = config.filters.enabled,
        "Starting veil-shell"
    );

    let shell = Arc::new(Shell::from_config(config)?);
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let maintenance = shell.spawn_maintenance(shutdown_rx);

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    let shutdown = async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C shutdown signal"),
            _ = sigterm_future => info!("Received SIGTERM shutdown signal"),
        }
    };

    let (bridge, outbound) = HostBridge::new(Arc::clone(&shell));
    bridge
        .run(tokio::io::stdin(), tokio::io::stdout(), outbound, shutdown)
        .await?;

    let _ = shutdown_tx.send(true);
    let _ = maintenance.await;

    #[cfg(feature = "metrics")]
    if let Some(guard) = metrics_guard
        && let Err(e) = guard.shutdown()
    {
        tracing::warn!(error = %e, "Failed to flush OpenTelemetry export");
    }
    #[cfg(not(feature = "metrics"))]
    let _ = metrics_guard;

    info!("veil-shell stopped");
    Ok(())
}
