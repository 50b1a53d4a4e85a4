//! devnetd entry point.
//!
//! Wires the store, credential store, plugin registry, runtimes and
//! controllers together, serves the API on TCP and the local socket, and
//! detaches supervisors on shutdown so node processes survive a daemon
//! restart.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use devnet_builder::auth::CredentialStore;
use devnet_builder::config::Config;
use devnet_builder::controller::{BroadcastHub, ControllerManager, ControllerState};
use devnet_builder::logs::LogManager;
use devnet_builder::plugin::{PluginRegistry, StablePlugin};
use devnet_builder::runtime::{DockerRuntime, ProcessRuntime, RuntimeSelector, ServiceRuntime};
use devnet_builder::store::Store;
use devnet_builder::api;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(true))
        .init();

    let config = Config::parse();
    let data_dir = config.data_dir();
    std::fs::create_dir_all(&data_dir)?;
    info!(
        data_dir = %data_dir.display(),
        "starting devnetd v{}",
        env!("CARGO_PKG_VERSION")
    );

    let store = Arc::new(Store::open(&config.store_path()).context("opening resource store")?);
    let credentials = Arc::new(
        CredentialStore::load(&config.credentials_path()).context("loading credentials")?,
    );
    let logs = Arc::new(LogManager::new(
        &config.logs_dir(),
        config.log_max_size,
        config.log_max_files,
    ));

    let plugins = Arc::new(PluginRegistry::default());
    plugins.register(Arc::new(StablePlugin::default()));

    let process = Arc::new(ProcessRuntime::new(logs.clone()));
    let runtimes = Arc::new(RuntimeSelector {
        process: process.clone(),
        service: Arc::new(ServiceRuntime::new(logs.clone())),
        docker: Arc::new(DockerRuntime::new()?),
    });

    let state = Arc::new(ControllerState {
        store,
        credentials,
        plugins,
        runtimes,
        logs,
        data_dir,
        provision_logs: BroadcastHub::default(),
    });

    let router = api::router(state.clone());
    {
        let router = router.clone();
        let listen = config.listen.clone();
        tokio::spawn(async move {
            if let Err(e) = api::serve_tcp(router, &listen).await {
                tracing::error!("tcp api server error: {e}");
            }
        });
    }
    {
        let router = router.clone();
        let socket = config.socket_path();
        tokio::spawn(async move {
            if let Err(e) = api::serve_uds(router, &socket).await {
                tracing::error!("unix api server error: {e}");
            }
        });
    }

    let manager = ControllerManager::new(state.clone());
    tokio::select! {
        result = manager.run() => result?,
        _ = shutdown_signal() => {
            // Leave node processes running; the next daemon reattaches
            // by PID.
            state.runtimes.process.detach_all();
            info!("shutting down");
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}
