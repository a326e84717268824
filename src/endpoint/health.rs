use crate::config::HealthCheckConfig;
use crate::endpoint::registry::{Endpoint, EndpointRegistry};
use futures_util::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Run a single round of health probes across all endpoints.
///
/// The caller is responsible for looping / scheduling. Probe concurrency is
/// capped at `cfg.concurrency` regardless of endpoint count.
pub async fn run_health_checks(
    registry: &EndpointRegistry,
    cfg: &HealthCheckConfig,
    client: &reqwest::Client,
) {
    let endpoints = registry.all();
    if endpoints.is_empty() {
        return;
    }

    stream::iter(endpoints)
        .map(|ep| {
            let client = client.clone();
            let cfg = cfg.clone();
            async move {
                check_one_endpoint(&client, registry, &cfg, &ep).await;
            }
        })
        .buffer_unordered(cfg.concurrency.max(1))
        .collect::<()>()
        .await;
}

async fn check_one_endpoint(
    client: &reqwest::Client,
    registry: &EndpointRegistry,
    cfg: &HealthCheckConfig,
    endpoint: &Arc<Endpoint>,
) {
    let url = format!("{}{}", endpoint.url, cfg.path);
    let start = Instant::now();

    let mut request = client.get(&url).timeout(cfg.probe_timeout());
    if !endpoint.token.is_empty() {
        request = request.bearer_auth(&endpoint.token);
    }
    if let Some(ref api_key) = endpoint.api_key {
        request = request.header("x-api-key", api_key);
    }

    let result = request.send().await;
    let elapsed = start.elapsed();

    match result {
        Ok(resp) if resp.status().is_success() => {
            registry.mark_healthy(&endpoint.name, elapsed);
            metrics::counter!(
                "relay_health_check_total",
                "endpoint" => endpoint.name.clone(),
                "result" => "success",
            )
            .increment(1);
            debug!(
                "health: check passed, endpoint={}, response_time_ms={}",
                endpoint.name,
                elapsed.as_millis()
            );
        }
        Ok(resp) => {
            let status = resp.status().as_u16();
            registry.mark_unhealthy(&endpoint.name, &format!("HTTP status {}", status));
            metrics::counter!(
                "relay_health_check_total",
                "endpoint" => endpoint.name.clone(),
                "result" => "failure",
            )
            .increment(1);
        }
        Err(e) => {
            registry.mark_unhealthy(&endpoint.name, &e.to_string());
            metrics::counter!(
                "relay_health_check_total",
                "endpoint" => endpoint.name.clone(),
                "result" => "failure",
            )
            .increment(1);
        }
    }
}
