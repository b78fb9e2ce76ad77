//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define engine metrics (apply passes, provider initialisation, listener churn)
//! - Expose Prometheus-compatible metrics endpoint
//!
//! # Metrics
//! - `tunnel_hub_apply_total` (counter): completed apply passes
//! - `tunnel_hub_apply_duration_seconds` (histogram): apply pass duration
//! - `tunnel_hub_provider_init_total` (counter): provider initialisations by type, result
//! - `tunnel_hub_listener_recreate_total` (counter): listener rebinds by role
//!
//! # Design Decisions
//! - Recording without an installed exporter is a no-op
//! - Labels are static strings

use std::net::SocketAddr;
use std::time::Duration;

use metrics_exporter_prometheus::PrometheusBuilder;

use crate::provider::ProviderType;

/// Install the Prometheus exporter listening on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_apply(elapsed: Duration) {
    ::metrics::counter!("tunnel_hub_apply_total").increment(1);
    ::metrics::histogram!("tunnel_hub_apply_duration_seconds").record(elapsed.as_secs_f64());
}

pub fn record_provider_init(kind: ProviderType, ok: bool) {
    let kind = match kind {
        ProviderType::Proxy => "proxy",
        ProviderType::Rule => "rule",
    };
    let result = if ok { "ok" } else { "error" };
    ::metrics::counter!("tunnel_hub_provider_init_total", "type" => kind, "result" => result)
        .increment(1);
}

pub fn record_listener_recreate(role: &'static str) {
    ::metrics::counter!("tunnel_hub_listener_recreate_total", "role" => role).increment(1);
}
