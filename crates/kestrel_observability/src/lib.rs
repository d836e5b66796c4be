//! Observability setup: structured logging, metrics (Prometheus), tracing.

use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber with structured logging.
pub fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,kestrel=debug"));

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

/// Initialize Prometheus metrics exporter.
pub fn init_metrics(listen_addr: &str) -> Result<(), Box<dyn std::error::Error>> {
    let addr: std::net::SocketAddr = listen_addr.parse()?;
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("Prometheus metrics endpoint on http://{}/metrics", addr);
    Ok(())
}

// ---------------------------------------------------------------------------
// Transaction state observability
// ---------------------------------------------------------------------------

/// Record the time a transaction spent in `state` before leaving it.
/// `has_lock` is true while the transaction held a lock wait at any point
/// in the measured interval.
pub fn record_txn_state_duration(state: &'static str, has_lock: bool, seconds: f64) {
    metrics::histogram!(
        "kestrel_txn_state_seconds",
        "state" => state,
        "has_lock" => if has_lock { "true" } else { "false" }
    )
    .record(seconds);
}

/// Count a transaction entering `state`.
pub fn record_txn_state_entered(state: &'static str) {
    metrics::counter!("kestrel_txn_state_entering_total", "state" => state).increment(1);
}

// ---------------------------------------------------------------------------
// DDL dispatcher observability
// ---------------------------------------------------------------------------

/// Track the number of DDL jobs currently delivered to a worker,
/// per worker class ("general" / "reorg").
pub fn record_ddl_running_jobs(worker_kind: &'static str, delta: i64) {
    if delta >= 0 {
        metrics::gauge!("kestrel_ddl_running_jobs", "type" => worker_kind).increment(delta as f64);
    } else {
        metrics::gauge!("kestrel_ddl_running_jobs", "type" => worker_kind)
            .decrement((-delta) as f64);
    }
}

/// Count dispatch-loop wakeups by source ("local", "tick", "watch").
pub fn record_ddl_wakeup(source: &'static str) {
    metrics::counter!("kestrel_ddl_wakeups_total", "source" => source).increment(1);
}

/// Count schema-sync barrier outcomes ("ok" / "timeout").
pub fn record_ddl_schema_sync(outcome: &'static str) {
    metrics::counter!("kestrel_ddl_schema_sync_total", "outcome" => outcome).increment(1);
}
