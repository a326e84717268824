use crate::config::{HealthCheckConfig, TransportConfig};
use anyhow::Result;
use std::time::Duration;

/// Shared outbound HTTP transports, built once at engine start and reused
/// across every request.
///
/// Three clients with distinct tuning:
/// - `unary`: pooled keep-alive client; the per-endpoint request deadline is
///   applied per request by the forwarder.
/// - `streaming`: keep-alives on, no overall client timeout (streams may run
///   for minutes); the response-header deadline is applied by the forwarder.
/// - `probe`: short-deadline client for health checks and latency probes.
#[derive(Clone)]
pub struct Transports {
    unary: reqwest::Client,
    streaming: reqwest::Client,
    probe: reqwest::Client,
}

impl Transports {
    pub fn build(transport: &TransportConfig, health: &HealthCheckConfig) -> Result<Self> {
        let unary = base_builder(transport)?
            .pool_idle_timeout(Duration::from_secs(transport.idle_timeout))
            .pool_max_idle_per_host(transport.pool_size)
            .build()?;

        let streaming = base_builder(transport)?
            .pool_idle_timeout(Duration::from_secs(transport.idle_timeout))
            .pool_max_idle_per_host(transport.pool_size)
            .tcp_keepalive(Some(Duration::from_secs(30)))
            .build()?;

        let probe = base_builder(transport)?
            .timeout(health.probe_timeout())
            .build()?;

        Ok(Self {
            unary,
            streaming,
            probe,
        })
    }

    pub fn unary(&self) -> &reqwest::Client {
        &self.unary
    }

    pub fn streaming(&self) -> &reqwest::Client {
        &self.streaming
    }

    pub fn probe(&self) -> &reqwest::Client {
        &self.probe
    }
}

fn base_builder(transport: &TransportConfig) -> Result<reqwest::ClientBuilder> {
    let mut builder = reqwest::Client::builder()
        .connect_timeout(transport.connect_timeout_duration())
        .tcp_nodelay(true);

    if !transport.tls_verify {
        builder = builder.danger_accept_invalid_certs(true);
    }

    if let Some(ref proxy) = transport.proxy {
        builder = builder.proxy(reqwest::Proxy::all(proxy.as_str())?);
    }

    Ok(builder)
}
