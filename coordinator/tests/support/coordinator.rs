use std::net::SocketAddr;
use std::sync::Arc;

use fleet_common::{
    config::CoordinatorConfig,
    protocol::{RegisterRequest, RegisterResponse},
    types::{default_catalog, Capabilities, NetworkAddress},
};
use fleet_coordinator::{
    api, balancer::WorkerSelector, registry::WorkerRegistry, store::ClusterStore, AppState,
};
use reqwest::Client;

use super::http::{spawn_router, TestServer};

/// テスト用に起動したコーディネーター一式
pub struct TestCoordinator {
    pub server: TestServer,
    pub state: AppState,
    // ストアのデータファイルをテスト終了まで保持する
    _data_dir: tempfile::TempDir,
}

impl TestCoordinator {
    pub fn addr(&self) -> SocketAddr {
        self.server.addr()
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.server.addr(), path)
    }
}

/// コーディネーターサーバーをテスト用に起動する
pub async fn spawn_coordinator() -> TestCoordinator {
    spawn_coordinator_with_config(CoordinatorConfig::default()).await
}

/// 設定を差し替えてコーディネーターを起動する
pub async fn spawn_coordinator_with_config(config: CoordinatorConfig) -> TestCoordinator {
    let data_dir = tempfile::tempdir().unwrap();
    let store = ClusterStore::open_at(data_dir.path().join("cluster.json"))
        .await
        .unwrap();
    let registry = WorkerRegistry::new(config.t_healthy_secs, config.t_dead_secs);
    let state = AppState {
        selector: WorkerSelector::new(registry.clone()),
        registry,
        store,
        catalog: Arc::new(default_catalog()),
        config,
        http: Client::new(),
    };

    let server = spawn_router(api::create_router(state.clone())).await;

    TestCoordinator {
        server,
        state,
        _data_dir: data_dir,
    }
}

/// 指定したコーディネーターにワーカーを登録する
pub async fn register_worker(
    coordinator_addr: SocketAddr,
    worker_addr: SocketAddr,
    gpu: bool,
) -> RegisterResponse {
    let response = Client::new()
        .post(format!("http://{coordinator_addr}/worker/register"))
        .json(&RegisterRequest {
            capabilities: stub_capabilities(gpu),
            network_address: NetworkAddress::Relay(worker_addr),
        })
        .send()
        .await
        .unwrap();

    assert!(response.status().is_success());
    response.json().await.unwrap()
}

/// スタブワーカーの能力記述子
pub fn stub_capabilities(gpu: bool) -> Capabilities {
    Capabilities {
        cpu_cores: 8,
        ram_bytes: 16 * 1024 * 1024 * 1024,
        gpu_present: gpu,
        gpu_vram_bytes: gpu.then_some(8 * 1024 * 1024 * 1024),
        disk_bytes: 256 * 1024 * 1024 * 1024,
        publicly_reachable: false,
    }
}
