//! sentineld - stream detection daemon
//!
//! This daemon:
//! 1. Loads configuration (`SENTINEL_CONFIG` file + `SENTINEL_*` env)
//! 2. Serves the control API (`/process-stream`, `/stop-stream`, `/pipelines`)
//! 3. Runs one pipeline thread per started stream until Ctrl-C

use anyhow::Result;
use std::sync::mpsc;
use std::sync::Arc;

use stream_sentinel::{
    api::{ApiConfig, ApiServer},
    config::SentinelConfig,
    DefaultFactory, Supervisor,
};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = SentinelConfig::load()?;
    if config.detector.url.is_none() {
        log::warn!("no detector url configured; set SENTINEL_DETECTOR_URL before starting streams");
    }
    log::info!(
        "sentineld {}: default kind {}, snapshots in {}",
        env!("CARGO_PKG_VERSION"),
        config.kind,
        config.snapshot_dir.display()
    );

    let api_config = ApiConfig {
        addr: config.api_addr.clone(),
        default_kind: config.kind,
    };
    let supervisor = Arc::new(Supervisor::new(Arc::new(DefaultFactory::new(config))));
    let api_handle = ApiServer::new(api_config, supervisor.clone()).spawn()?;
    log::info!("control api listening on {}", api_handle.addr);

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .expect("error setting Ctrl-C handler");

    log::info!("sentineld waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping API server and pipelines...");
    api_handle.stop()?;
    let reports = supervisor.shutdown();
    for report in &reports {
        log::info!(
            "pipeline {}: {} samples, {} alerts sent, {} failed",
            report.source_uri,
            report.samples,
            report.alerts_sent,
            report.alerts_failed
        );
    }

    Ok(())
}
