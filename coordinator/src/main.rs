//! Fleet Coordinator Server Entry Point

use fleet_common::{config::CoordinatorConfig, types::default_catalog};
use fleet_coordinator::{
    api, balancer::WorkerSelector, health::HealthMonitor, logging, registry::WorkerRegistry,
    store::ClusterStore, AppState,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() {
    logging::init().expect("failed to initialize logging");

    info!("Fleet Coordinator v{}", env!("CARGO_PKG_VERSION"));

    let config = CoordinatorConfig::from_env();
    let catalog = Arc::new(default_catalog());

    let store = ClusterStore::open()
        .await
        .expect("Failed to open cluster store");

    let registry = WorkerRegistry::new(config.t_healthy_secs, config.t_dead_secs);
    let selector = WorkerSelector::new(registry.clone());

    let health_monitor = HealthMonitor::new(
        registry.clone(),
        catalog.clone(),
        config.rebalance_interval_secs,
        config.max_services_per_worker,
    );
    health_monitor.start();

    let state = AppState {
        registry,
        selector,
        store,
        catalog,
        config: config.clone(),
        http: reqwest::Client::new(),
    };

    let router = api::create_router(state);

    let bind_addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .expect("Failed to bind to address");

    info!("Coordinator listening on {}", bind_addr);

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .expect("Server error");
}
