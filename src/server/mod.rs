mod admin;
pub mod bootstrap;
pub mod runtime;
mod state;

pub use state::RelayState;

use crate::proxy;
use anyhow::Result;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

/// Run the inbound relay server with graceful shutdown support.
///
/// When the state's shutdown token trips the server stops accepting new
/// connections and waits up to `DRAIN_TIMEOUT` for in-flight requests to
/// complete before forcibly dropping them.
pub async fn run_relay_server(listen: &str, state: RelayState) -> Result<()> {
    const DRAIN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

    let addr: SocketAddr = listen.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!("server: relay listening, addr={}", addr);

    let shutdown = state.shutdown.clone();
    let active_conns = Arc::new(AtomicI64::new(0));

    loop {
        let accepted = tokio::select! {
            result = listener.accept() => result,
            _ = shutdown.cancelled() => {
                info!("server: relay: stop accepting new connections, draining...");
                break;
            }
        };

        let (stream, peer_addr) = match accepted {
            Ok(v) => {
                metrics::counter!("relay_connections_total", "status" => "accepted").increment(1);
                v
            }
            Err(e) => {
                error!("server: relay: accept failed, error={}", e);
                metrics::counter!("relay_connections_total", "status" => "error").increment(1);
                continue;
            }
        };

        metrics::gauge!("relay_connections_active").increment(1.0);
        active_conns.fetch_add(1, Ordering::Relaxed);

        let state = state.clone();
        let active_conns = active_conns.clone();

        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let state_inner = state.clone();
            let svc = service_fn(move |req: Request<Incoming>| {
                let state = state_inner.clone();
                async move { proxy::handle_request(req, state).await }
            });

            if let Err(e) = auto::Builder::new(TokioExecutor::new())
                .http1()
                .keep_alive(true)
                .http2()
                .keep_alive_interval(Some(std::time::Duration::from_secs(20)))
                .serve_connection_with_upgrades(io, svc)
                .await
            {
                if !e.to_string().contains("connection closed") {
                    error!(
                        "server: relay: connection error, peer={}, error={}",
                        peer_addr, e
                    );
                }
            }

            metrics::gauge!("relay_connections_active").decrement(1.0);
            active_conns.fetch_sub(1, Ordering::Relaxed);
        });
    }

    // Drain phase: wait for all in-flight connections to finish (or timeout).
    let active = active_conns.load(Ordering::Relaxed);
    if active > 0 {
        info!("server: relay: waiting for {} active connections to drain", active);
        let drain = async {
            loop {
                if active_conns.load(Ordering::Relaxed) == 0 {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        };
        match tokio::time::timeout(DRAIN_TIMEOUT, drain).await {
            Ok(_) => info!("server: relay: all connections drained"),
            Err(_) => {
                let remaining = active_conns.load(Ordering::Relaxed);
                info!(
                    "server: relay: drain timeout ({}s), {} connections still active",
                    DRAIN_TIMEOUT.as_secs(),
                    remaining
                );
            }
        }
    }

    Ok(())
}

/// Run the admin server: health/readiness, metrics, introspection, and the
/// group/endpoint control operations.
pub async fn run_admin_server(listen: &str, state: RelayState) -> Result<()> {
    let addr: SocketAddr = listen.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!("server: admin listening, addr={}", addr);

    let shutdown = state.shutdown.clone();

    loop {
        let accepted = tokio::select! {
            result = listener.accept() => result,
            _ = shutdown.cancelled() => return Ok(()),
        };
        let (stream, _) = accepted?;
        let state = state.clone();

        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let svc = service_fn(move |req: Request<Incoming>| {
                let state = state.clone();
                async move { admin::handle_admin(req, state) }
            });

            if let Err(e) = auto::Builder::new(TokioExecutor::new())
                .http1()
                .keep_alive(true)
                .serve_connection_with_upgrades(io, svc)
                .await
            {
                if !e.to_string().contains("connection closed") {
                    error!("server: admin: connection error, error={}", e);
                }
            }
        });
    }
}
