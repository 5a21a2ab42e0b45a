// clousocket: RESP command server with admission control, adaptive
// heartbeats, and a pooled upstream key/value store.

use clap::Parser;
use clousocket::catalog::CommandTable;
use clousocket::handlers::HandlerRegistry;
use clousocket::supervisor::Supervisor;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "clousocket", version, about = "RESP command server")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "clousocket.toml")]
    config: PathBuf,

    /// Directory of command descriptor JSON files.
    #[arg(long = "commands-dir", default_value = "commands")]
    commands_dir: PathBuf,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    info!(version = env!("CARGO_PKG_VERSION"), "clousocket starting");

    let config = match clousocket::config::load_config_from_path(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("FATAL: failed to load config: {e}");
            std::process::exit(1);
        }
    };

    let table = match CommandTable::load_dir(&cli.commands_dir) {
        Ok(table) => table,
        Err(e) => {
            eprintln!("FATAL: failed to load command catalog: {e}");
            std::process::exit(1);
        }
    };

    let supervisor = match Supervisor::new(
        config,
        Arc::new(table),
        Arc::new(HandlerRegistry::builtin()),
    ) {
        Ok(supervisor) => supervisor,
        Err(e) => {
            eprintln!("FATAL: {e}");
            std::process::exit(1);
        }
    };

    let (addr, serve_handle) = match supervisor.bind_and_serve().await {
        Ok(bound) => bound,
        Err(e) => {
            let network = &supervisor.config().network;
            eprintln!("FATAL: failed to bind {}:{}: {e}", network.host, network.port);
            std::process::exit(1);
        }
    };
    info!(%addr, "clousocket listening");

    tokio::select! {
        result = serve_handle => {
            if let Ok(Err(e)) = result {
                eprintln!("FATAL: accept loop failed: {e}");
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    supervisor.shutdown().await;
}
