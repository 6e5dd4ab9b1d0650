use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use redoubt_server::config::NetworkConfig;
use redoubt_server::server::GameServer;

fn main() {
    // Fatal startup failures (bad config, double transport failure) exit
    // non-zero; a normal quit exits 0.
    if let Err(err) = run() {
        eprintln!("fatal: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config/network.json"));
    let config = NetworkConfig::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    init_logging(&config)?;

    info!("redoubt-server v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "binding {}:{} as node '{}' in {:?} mode ({} known peers)",
        config.host,
        config.port,
        config.node_id,
        config.mode,
        config.peers.len()
    );

    let server = GameServer::launch(config).context("starting game server")?;
    let _local = server
        .add_local_client("host", env!("CARGO_PKG_VERSION"))
        .context("no free slot for the local client")?;

    while !server.has_finished() {
        std::thread::sleep(Duration::from_millis(100));
    }
    info!("server stopped");
    Ok(())
}

fn init_logging(config: &NetworkConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.as_tracing_directive()));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    match &config.logging.file {
        Some(path) => {
            let file = std::fs::File::create(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            builder
                .with_writer(std::sync::Mutex::new(file))
                .with_ansi(false)
                .init();
        }
        None => builder.init(),
    }
    Ok(())
}
