//! alert_receiver - collects alerts posted by sentineld pipelines
//!
//! Stores each snapshot on disk, lists alerts at `/alerts` and renders a
//! gallery at `/`.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;

use stream_sentinel::receiver::{AlertStore, ReceiverConfig, ReceiverServer};

#[derive(Parser, Debug)]
#[command(author, version, about = "Receive and display stream alerts")]
struct Args {
    /// Address to listen on.
    #[arg(long, env = "RECEIVER_ADDR", default_value = "127.0.0.1:8000")]
    addr: String,

    /// Directory received snapshots are written to.
    #[arg(long, env = "RECEIVER_SNAPSHOT_DIR", default_value = "received")]
    snapshot_dir: PathBuf,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let store = Arc::new(AlertStore::new());
    let handle = ReceiverServer::new(
        ReceiverConfig {
            addr: args.addr,
            snapshot_dir: args.snapshot_dir.clone(),
        },
        store.clone(),
    )
    .spawn()?;
    log::info!(
        "alert receiver on http://{} (snapshots in {})",
        handle.addr,
        args.snapshot_dir.display()
    );

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .expect("error setting Ctrl-C handler");

    let _ = rx.recv();
    log::info!("shutdown signal received after {} alerts", store.len());
    handle.stop()?;
    Ok(())
}
