use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: booking validations run (standalone or inside a mutation).
pub const VALIDATIONS_TOTAL: &str = "rota_validations_total";

/// Counter: rejections. Labels: code.
pub const REJECTIONS_TOTAL: &str = "rota_rejections_total";

/// Counter: sessions created.
pub const SESSIONS_CREATED_TOTAL: &str = "rota_sessions_created_total";

/// Counter: sessions cancelled.
pub const SESSIONS_CANCELLED_TOTAL: &str = "rota_sessions_cancelled_total";

/// Counter: appointments created.
pub const APPOINTMENTS_CREATED_TOTAL: &str = "rota_appointments_created_total";

/// Counter: teacher reassignment operations committed.
pub const REASSIGNMENTS_TOTAL: &str = "rota_reassignments_total";

/// Counter: batch generation runs. Labels: policy.
pub const BATCH_RUNS_TOTAL: &str = "rota_batch_runs_total";

/// Counter: occurrences skipped across SKIP-policy batch runs.
pub const BATCH_SKIPPED_TOTAL: &str = "rota_batch_skipped_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "rota_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "rota_wal_flush_batch_size";

/// Install a Prometheus metrics exporter on the given port. No-op if the
/// port is None; embedders that install their own recorder skip this.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}
