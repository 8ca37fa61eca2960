//! Fleet Worker Agent Entry Point

use fleet_common::config::WorkerConfig;
use fleet_worker::{agent::Agent, logging};
use tracing::{error, info};

#[tokio::main]
async fn main() {
    logging::init().expect("failed to initialize logging");

    info!("Fleet Worker v{}", env!("CARGO_PKG_VERSION"));

    let config = WorkerConfig::from_env();

    let agent = match Agent::bootstrap(config) {
        Ok(agent) => agent,
        Err(err) => {
            error!("Failed to bootstrap agent: {}", err);
            std::process::exit(1);
        }
    };

    if let Err(err) = agent.run().await {
        error!("Agent terminated with error: {}", err);
        std::process::exit(1);
    }

    info!("Worker shut down cleanly");
}
