#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use anyhow::Result;
use clap::Parser;
use relay_gateway::server;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "relay-gateway",
    about = "Health-aware forwarding relay for LLM API providers"
)]
struct Cli {
    /// Path to relay config file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Listen address for the relay endpoint
    #[arg(short, long, default_value = "127.0.0.1:8080")]
    listen: String,

    /// Admin API listen address (health/metrics/group control)
    #[arg(long, default_value = "127.0.0.1:9091")]
    admin_listen: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let worker_threads = server::runtime::worker_thread_count();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()?;

    rt.block_on(server::bootstrap::run(server::bootstrap::BootstrapArgs {
        config_path: cli.config,
        listen: cli.listen,
        admin_listen: cli.admin_listen,
    }))
}
