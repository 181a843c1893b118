// lorawan-stack: runs the whole pipeline behind one SemTech UDP listener.

use std::path::Path;

use clap::{Arg, Command};
use lorawan_stack::config::{DEFAULT_CONFIG_PATH, load_config_from_path};
use lorawan_stack::node::{Node, NodeStores};
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "lorawan-stack starting");

    let matches = Command::new("lorawan-stack")
        .version(env!("CARGO_PKG_VERSION"))
        .about("LoRaWAN router, broker and handler in one process")
        .arg(
            Arg::new("config")
                .help("Path to the TOML configuration")
                .short('c')
                .long("config")
                .default_value(DEFAULT_CONFIG_PATH),
        )
        .get_matches();
    let config_path = matches
        .get_one::<String>("config")
        .cloned()
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_owned());

    // -------------------------------------------------------------------------
    // 1. Config and storage
    // -------------------------------------------------------------------------
    let config = load_config_from_path(Path::new(&config_path)).unwrap_or_else(|e| {
        eprintln!("FATAL: failed to load config: {e}");
        std::process::exit(1);
    });

    if let Err(e) = std::fs::create_dir_all(&config.storage.dir) {
        eprintln!("FATAL: could not create storage directory: {e}");
        std::process::exit(1);
    }
    let stores = NodeStores::open(&config.storage).unwrap_or_else(|e| {
        eprintln!("FATAL: failed to open storage: {e}");
        std::process::exit(1);
    });

    // -------------------------------------------------------------------------
    // 2. Components and devices
    // -------------------------------------------------------------------------
    let node = Node::start(stores, &config).unwrap_or_else(|e| {
        eprintln!("FATAL: failed to start node: {e}");
        std::process::exit(1);
    });
    for device in &config.devices {
        if let Err(e) = node.register_device(device).await {
            eprintln!("FATAL: failed to register device {}: {e}", device.dev_eui);
            std::process::exit(1);
        }
    }

    // -------------------------------------------------------------------------
    // 3. Gateway listener
    // -------------------------------------------------------------------------
    let server = node
        .bind_gateway(&config.gateway.bind)
        .await
        .unwrap_or_else(|e| {
            eprintln!("FATAL: failed to bind gateway listener on {}: {e}", config.gateway.bind);
            std::process::exit(1);
        });
    match server.local_addr() {
        Ok(addr) => info!(addr = %addr, devices = config.devices.len(), "gateway listener ready"),
        Err(e) => error!(error = %e, "gateway listener has no local address"),
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server_task = tokio::spawn(server.run(shutdown_rx));

    tokio::signal::ctrl_c().await.ok();
    info!("shutdown: Ctrl-C received");
    shutdown_tx.send(true).ok();

    match server_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "gateway listener exited with error"),
        Err(e) => error!(error = %e, "gateway listener task failed"),
    }
    node.shutdown().await;
}
