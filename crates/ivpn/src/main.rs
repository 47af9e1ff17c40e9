//! iVPN: Headless Session Host
//!
//! Runs the session core against the engine binary. UI commands are read as
//! JSON lines from stdin; replies and status events are written as JSON lines
//! to stdout. Logs go to stderr.
//!
//! ```text
//! ivpn [service.toml|service.json]
//! ```

use anyhow::{Context, Result};
use ivpn_core::{
    Call, HeadlessHost, HostTunProvider, INVALID_ARGUMENT, ProcessEngine, Reply, ServiceConfig,
    VpnManager, dispatch,
};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging on stderr; stdout carries replies
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .compact()
                .with_writer(std::io::stderr),
        )
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ivpn=info,ivpn_core=info".into()),
        )
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => ServiceConfig::load(Path::new(&path))
            .with_context(|| format!("Failed to load service config {}", path))?,
        None => ServiceConfig::default(),
    };

    let work_dir = config.engine_work_dir();
    std::fs::create_dir_all(&work_dir)
        .with_context(|| format!("Failed to create {}", work_dir.display()))?;

    info!("iVPN starting...");
    info!("Engine: {}", config.engine.binary.display());

    let engine = Arc::new(ProcessEngine::new(config.engine.binary.clone(), work_dir));
    let tun = Arc::new(match config.tun.fd {
        Some(fd) => HostTunProvider::with_fd(fd),
        None => HostTunProvider::new(),
    });
    let manager = VpnManager::new(&config, engine, tun, Arc::new(HeadlessHost));

    // Forward status events
    let status = manager.subscribe();
    std::thread::spawn(move || {
        for event in status {
            println!("{}", json!({ "status": event.to_string() }));
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let reply = match serde_json::from_str::<Call>(line) {
            Ok(call) => dispatch(&manager, call).await,
            Err(e) => {
                warn!("Malformed call: {}", e);
                Reply::error(INVALID_ARGUMENT, e.to_string())
            }
        };
        println!("{}", serde_json::to_string(&reply)?);
    }

    // Input closed; leave nothing running
    manager.stop_test_proxy().await;
    manager.stop().await;
    manager.unsubscribe();

    info!("iVPN shutting down");
    Ok(())
}
