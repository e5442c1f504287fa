//! Prometheus metrics for the scheduler.
//!
//! Provides metrics for:
//! - Cycles per job type and outcome
//! - Unit launches per job type and outcome
//! - Overlapping cycles skipped by the in-flight guard
//! - Stale executions reconciled
//!
//! Without the `prometheus` feature every recorder is a no-op.

#[cfg(feature = "prometheus")]
use metrics::{counter, gauge, histogram};
#[cfg(feature = "prometheus")]
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::config::MetricsConfig;

/// Install the Prometheus recorder and its scrape listener.
///
/// Must be called from within a Tokio runtime.
#[cfg(feature = "prometheus")]
pub fn init_metrics(config: &MetricsConfig) -> Result<(), MetricsError> {
    if !config.enabled {
        return Ok(());
    }

    let addr = config
        .listen_addr()
        .map_err(|e| MetricsError::Setup(e.to_string()))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(MetricsError::Install)?;

    tracing::info!(listen = %addr, "Prometheus exporter listening");
    Ok(())
}

/// Initialize the metrics system (no-op without prometheus feature).
#[cfg(not(feature = "prometheus"))]
pub fn init_metrics(config: &MetricsConfig) -> Result<(), MetricsError> {
    if config.enabled {
        tracing::warn!(
            "Metrics are enabled in config but the 'prometheus' feature is not compiled. \
             Rebuild with: cargo build --features prometheus"
        );
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Metric Recording Functions
// ─────────────────────────────────────────────────────────────────────────────

/// Record a finished scheduler cycle.
///
/// # Arguments
/// * `job_type` - `archival` or `purge`
/// * `outcome` - `completed`, `failed` (policies could not be loaded) or `skipped`
/// * `duration_secs` - Wall time spent launching units
pub fn record_cycle(job_type: &str, outcome: &str, duration_secs: f64) {
    #[cfg(feature = "prometheus")]
    {
        counter!(
            "das_cycles_total",
            "job_type" => job_type.to_string(),
            "outcome" => outcome.to_string()
        )
        .increment(1);

        if outcome != "skipped" {
            histogram!(
                "das_cycle_duration_seconds",
                "job_type" => job_type.to_string()
            )
            .record(duration_secs);
        }
    }
    #[cfg(not(feature = "prometheus"))]
    {
        let _ = (job_type, outcome, duration_secs);
    }
}

/// Record one unit launch attempt.
pub fn record_launch(job_type: &str, success: bool) {
    #[cfg(feature = "prometheus")]
    {
        let outcome = if success { "success" } else { "error" };
        counter!(
            "das_worker_launches_total",
            "job_type" => job_type.to_string(),
            "outcome" => outcome.to_string()
        )
        .increment(1);
    }
    #[cfg(not(feature = "prometheus"))]
    {
        let _ = (job_type, success);
    }
}

/// Record `running` executions marked failed by stale reconciliation.
pub fn record_stale_executions(job_type: &str, count: u64) {
    #[cfg(feature = "prometheus")]
    {
        counter!(
            "das_stale_executions_total",
            "job_type" => job_type.to_string()
        )
        .increment(count);
    }
    #[cfg(not(feature = "prometheus"))]
    {
        let _ = (job_type, count);
    }
}

/// Record the enabled policy count seen by the latest cycle.
pub fn set_enabled_policies(job_type: &str, count: usize) {
    #[cfg(feature = "prometheus")]
    {
        gauge!(
            "das_enabled_policies",
            "job_type" => job_type.to_string()
        )
        .set(count as f64);
    }
    #[cfg(not(feature = "prometheus"))]
    {
        let _ = (job_type, count);
    }
}

/// Metrics initialization errors.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("Failed to set up metrics: {0}")]
    Setup(String),
    #[cfg(feature = "prometheus")]
    #[error("Failed to install metrics recorder: {0}")]
    Install(#[from] metrics_exporter_prometheus::BuildError),
}
