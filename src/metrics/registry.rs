use metrics::{describe_counter, describe_gauge, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Thin handle around the global metrics recorder.
///
/// After `Metrics::install()` the `metrics` crate macros (`counter!`,
/// `gauge!`, `histogram!`) can be used anywhere in the codebase. The
/// `PrometheusHandle` is retained solely for rendering the `/metrics`
/// endpoint.
#[derive(Clone)]
pub struct Metrics {
    handle: PrometheusHandle,
}

impl Metrics {
    /// Install the global Prometheus recorder and register metric
    /// descriptions. When a recorder is already installed (tests building
    /// several engines in one process), a detached handle is used instead —
    /// macros keep working against whichever recorder won.
    pub fn install() -> Self {
        let handle = match PrometheusBuilder::new().install_recorder() {
            Ok(handle) => handle,
            Err(_) => PrometheusBuilder::new().build_recorder().handle(),
        };

        // --- Describe all metrics (adds HELP / TYPE lines) ---

        describe_counter!(
            "relay_requests_total",
            Unit::Count,
            "Finished requests by handler kind and terminal status"
        );
        describe_gauge!(
            "relay_requests_in_flight",
            Unit::Count,
            "Requests currently holding a live lifecycle"
        );
        describe_counter!(
            "relay_upstream_retries_total",
            Unit::Count,
            "Same-endpoint retry attempts"
        );
        describe_counter!(
            "relay_endpoint_switches_total",
            Unit::Count,
            "Endpoint switchovers after retry exhaustion"
        );
        describe_counter!(
            "relay_stream_errors_total",
            Unit::Count,
            "Streams that failed after bytes reached the client"
        );

        describe_gauge!(
            "relay_endpoint_health_status",
            Unit::Count,
            "Endpoint health: 1=healthy 0=unhealthy"
        );
        describe_counter!(
            "relay_health_check_total",
            Unit::Count,
            "Active health probe attempts"
        );

        describe_gauge!(
            "relay_suspended_requests",
            Unit::Count,
            "Requests currently parked waiting for recovery"
        );
        describe_counter!(
            "relay_group_switch_total",
            Unit::Count,
            "Group activations (including force activations)"
        );

        describe_counter!(
            "relay_connections_total",
            Unit::Count,
            "Downstream connections accepted"
        );
        describe_gauge!(
            "relay_connections_active",
            Unit::Count,
            "Active downstream connections"
        );

        Self { handle }
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}
