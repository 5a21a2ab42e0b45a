//! Shared fixtures for the integration suites: a config builder pointed at a
//! test store, a programmatic catalog, and a server spawner.

// Each integration binary compiles this module separately and uses a subset.
#![allow(dead_code)]

use clousocket::catalog::CommandTable;
use clousocket::config::Config;
use clousocket::handlers::HandlerRegistry;
use clousocket::supervisor::Supervisor;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Heartbeat tuning for a test, all milliseconds.
#[derive(Clone, Copy)]
pub struct HeartbeatTuning {
    pub min: u64,
    pub max: u64,
    pub init: u64,
    pub timeout: u64,
}

/// Long intervals so heartbeats never interfere with a non-heartbeat test.
pub const HB_QUIET: HeartbeatTuning = HeartbeatTuning {
    min: 30_000,
    max: 60_000,
    init: 30_000,
    timeout: 30_000,
};

/// Config bound to an OS-assigned port, pointed at `store_url`.
pub fn test_config(store_url: &str, hb: HeartbeatTuning) -> Config {
    clousocket::config::load_config_from_str(&format!(
        r#"
        [network]
        host = "127.0.0.1"
        port = 0

        [redis]
        url = "{store_url}"
        max-connections = 4

        [heartbeat]
        hb-min-interval = {}
        hb-max-interval = {}
        hb-init-interval = {}
        hb-timeout = {}
        "#,
        hb.min, hb.max, hb.init, hb.timeout
    ))
    .expect("test config must parse")
}

/// The catalog the shipped descriptor files would produce, built
/// programmatically so tests do not depend on the working directory.
pub fn builtin_table() -> CommandTable {
    let mut table = CommandTable::new();
    table.register_command("ping", "ping", None);
    table.register_command("echo", "echo", None);
    table.register_command("heartbeat", "heartbeat", None);
    table.register_command("store", "store_info", None);
    table.register_subcommand("store", "get", "store_get", None);
    table.register_subcommand("store", "set", "store_set", None);
    table.register_subcommand("store", "del", "store_del", None);
    table
}

/// Start a full server with the built-in rule chain; returns it with its
/// bound address.
pub async fn spawn_server(
    config: Config,
    table: CommandTable,
    handlers: HandlerRegistry,
) -> (Arc<Supervisor>, SocketAddr) {
    let supervisor = Supervisor::new(config, Arc::new(table), Arc::new(handlers))
        .expect("supervisor must start");
    let (addr, _handle) = supervisor
        .bind_and_serve()
        .await
        .expect("bind on 127.0.0.1:0 must succeed");
    (supervisor, addr)
}

/// Wait until the registry reaches `expected` live sessions.
pub async fn await_registry_len(supervisor: &Supervisor, expected: usize) {
    for _ in 0..100 {
        if supervisor.registry().len() == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!(
        "registry never reached {expected} sessions (now {})",
        supervisor.registry().len()
    );
}
