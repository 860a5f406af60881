use std::sync::Arc;

use clap::Parser;
use log::{error, info};
use tokio::net::TcpListener;

mod config;
mod coordinator;
mod protocol;
mod sched;
mod session;
mod trace;

use config::{Config, Options};
use coordinator::Coordinator;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::builder().format_timestamp_millis().init();

    let options = Options::parse();
    let config = match Config::resolve(options) {
        Ok(config) => config,
        Err(e) => {
            error!("configuration error: {}", e);
            return Err(e.into());
        }
    };
    info!("coordinating {} total nodes", config.total_nodes);

    let bind_host = config.bind_host.clone();
    let port = config.port;
    let coord = Arc::new(Coordinator::new(config)?);
    coord.bootstrap_jobs();

    let listener = TcpListener::bind((bind_host.as_str(), port)).await?;
    info!("serving on {}", listener.local_addr()?);

    tokio::select! {
        _ = session::serve(Arc::clone(&coord), listener) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
        }
    }

    coord.begin_shutdown();
    coord.flush_trace();
    Ok(())
}
