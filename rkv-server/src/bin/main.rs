//! # rkv-server entrypoint
//!
//! Loads configuration, wires up the storage engine (with AOF durability if
//! enabled) and, when the config names a cluster, the router sitting in
//! front of it, then accepts RESP2 connections until shut down.

use std::process::ExitCode;
use std::sync::Arc;

use rkv_cluster::ClusterRouter;
use rkv_common::{Config, RkvResult};
use rkv_engine::aof::AofWriter;
use rkv_engine::{DataEngine, Expirer};
use rkv_server::metrics::Metrics;
use rkv_server::server::{handle_connection, Backend};
use tokio::net::TcpListener;
use tokio::signal;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt::init();

    let config_path = std::env::args().nth(1).unwrap_or_else(|| "rkv.conf".to_string());
    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(path = %config_path, error = %err, "no config file found, using defaults");
            Config::default()
        }
    };

    if let Err(err) = run(config).await {
        tracing::error!(error = %err, "server exited with an error");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

async fn run(config: Config) -> RkvResult<()> {
    let engine = if config.append_only {
        let mut engine = DataEngine::new();
        AofWriter::load(&config.append_filename, &engine)?;
        let writer = AofWriter::open(&config.append_filename)?;
        engine.attach_aof_sink(Arc::new(writer));
        Arc::new(engine)
    } else {
        Arc::new(DataEngine::new())
    };

    let _expirer = Expirer::start(engine.clone());

    let backend = if config.is_cluster_enabled() {
        tracing::info!(self_addr = %config.self_addr, peers = ?config.peers, "starting in cluster mode");
        Backend::Cluster(Arc::new(ClusterRouter::new(&config, engine.clone())))
    } else {
        tracing::info!("starting in standalone mode");
        Backend::Standalone(engine.clone())
    };

    let metrics = Arc::new(Metrics::new());
    let addr = config.addr()?;
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                let backend = backend.clone();
                let metrics = metrics.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_connection(stream, backend, metrics).await {
                        tracing::debug!(%peer, error = %err, "connection closed with an error");
                    }
                });
            }
            _ = signal::ctrl_c() => {
                tracing::info!("shutdown signal received");
                return Ok(());
            }
        }
    }
}
