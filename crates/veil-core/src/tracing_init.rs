//! Shared tracing/logging initialization.
//!
//! Installs a `tracing_subscriber` registry with an env-filter and either
//! human-readable or JSON output.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialise the global tracing subscriber.
///
/// * `default_filter` -- default `RUST_LOG` value when the env-var is not set
///   (e.g. `"veil_shell=info"`).
/// * `log_json` -- when `true`, emit structured JSON log lines instead of the
///   human-readable format.
///
/// Logs go to stderr: stdout carries the host bridge protocol.
pub fn init_tracing(default_filter: &str, log_json: bool) {
    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()),
    );
    if log_json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

/// Initialise tracing and, when an endpoint is given, the OTLP export
/// pipeline with spans bridged through `tracing-opentelemetry`.
///
/// The returned guard must be held for the process lifetime.
#[cfg(feature = "metrics")]
pub fn init_tracing_with_metrics(
    default_filter: &str,
    log_json: bool,
    metrics_endpoint: Option<&str>,
) -> Option<crate::metrics::MetricsGuard> {
    use opentelemetry::trace::TracerProvider as _;

    let (guard, init_error) = match metrics_endpoint.map(crate::metrics::init_metrics) {
        Some(Ok(guard)) => (Some(guard), None),
        Some(Err(e)) => (None, Some(e)),
        None => (None, None),
    };
    let otel_layer = guard.as_ref().map(|g| {
        tracing_opentelemetry::layer()
            .with_tracer(g.tracer_provider().tracer(crate::metrics::METER_NAME))
    });

    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()),
    );
    let json_layer = log_json.then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
    });
    let text_layer =
        (!log_json).then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(text_layer)
        .with(otel_layer)
        .init();

    if let Some(e) = init_error {
        tracing::warn!(error = %e, "Failed to initialise OpenTelemetry export");
    } else if let Some(endpoint) = metrics_endpoint {
        tracing::info!(endpoint, "OpenTelemetry export enabled");
    }
    guard
}

/// Without the `metrics` feature the endpoint is ignored.
#[cfg(not(feature = "metrics"))]
pub fn init_tracing_with_metrics(
    default_filter: &str,
    log_json: bool,
    metrics_endpoint: Option<&str>,
) -> Option<()> {
    init_tracing(default_filter, log_json);
    if metrics_endpoint.is_some() {
        tracing::warn!("Metrics endpoint given but the `metrics` feature is disabled");
    }
    None
}
