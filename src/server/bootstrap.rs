use crate::endpoint;
use crate::{config, server};
use anyhow::Result;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// CLI arguments forwarded from `main()`.
pub struct BootstrapArgs {
    pub config_path: std::path::PathBuf,
    pub listen: String,
    pub admin_listen: String,
}

/// Relay lifecycle: init → first health round → watch loops → serve → shutdown.
pub async fn run(args: BootstrapArgs) -> Result<()> {
    init_tracing();

    // Phase 1: build the engine bottom-up.
    let relay_config = config::RelayConfig::load(&args.config_path)?;
    let state = server::RelayState::new(relay_config)?;

    // Phase 2: synchronous first health round — candidate ordering should
    // reflect reality before the first request lands.
    endpoint::run_health_checks(
        &state.registry,
        &state.config.health_check,
        state.transports.probe(),
    )
    .await;
    tracing::info!("health: initial round completed");

    // Phase 3: periodic health checking.
    start_health_check_loop(&state);

    // Phase 4: admin + relay servers.
    start_admin_server(&state, &args);

    tracing::info!("server: starting relay, listen={}", args.listen);
    let relay_handle = tokio::spawn({
        let listen = args.listen.clone();
        let state = state.clone();
        async move { server::run_relay_server(&listen, state).await }
    });

    // Phase 5: block until a signal, then cancel everything and drain.
    wait_for_signal().await;
    tracing::info!("server: shutdown signal received");
    state.shutdown.cancel();

    if let Err(e) = relay_handle.await {
        tracing::error!("server: relay task error: {}", e);
    }

    tracing::info!("server: shutdown complete");
    Ok(())
}

fn init_tracing() {
    let (non_blocking, _guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .buffered_lines_limit(128_000)
        .lossy(true)
        .finish(std::io::stdout());

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false)
                .json(),
        )
        .init();

    std::mem::forget(_guard);
}

fn start_health_check_loop(state: &server::RelayState) {
    let state = state.clone();
    tokio::spawn(async move {
        let interval = state.config.health_check.interval_duration();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = state.shutdown.cancelled() => return,
            }
            endpoint::run_health_checks(
                &state.registry,
                &state.config.health_check,
                state.transports.probe(),
            )
            .await;
        }
    });
}

fn start_admin_server(state: &server::RelayState, args: &BootstrapArgs) {
    let listen = args.admin_listen.clone();
    let state = state.clone();
    tokio::spawn(async move {
        if let Err(e) = server::run_admin_server(&listen, state).await {
            tracing::error!("server: admin server error: {}", e);
        }
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("server: failed to install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
