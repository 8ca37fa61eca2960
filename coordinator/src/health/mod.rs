//! ヘルスモニター
//!
//! 定期的にワーカーの再分類・削除とギャップの再割り当てを行う

use crate::registry::WorkerRegistry;
use fleet_common::types::ServiceType;
use std::sync::Arc;
use tokio::time::{interval, Duration};
use tracing::{info, warn};

/// ヘルスモニター
pub struct HealthMonitor {
    registry: WorkerRegistry,
    catalog: Arc<Vec<ServiceType>>,
    interval_secs: u64,
    max_services_per_worker: usize,
}

impl HealthMonitor {
    /// 新しいヘルスモニターを作成
    pub fn new(
        registry: WorkerRegistry,
        catalog: Arc<Vec<ServiceType>>,
        interval_secs: u64,
        max_services_per_worker: usize,
    ) -> Self {
        Self {
            registry,
            catalog,
            interval_secs,
            max_services_per_worker,
        }
    }

    /// バックグラウンドで監視を開始
    pub fn start(self) {
        tokio::spawn(async move {
            self.monitor_loop().await;
        });
    }

    /// 監視ループ
    async fn monitor_loop(&self) {
        let mut timer = interval(Duration::from_secs(self.interval_secs));

        info!(
            interval_secs = self.interval_secs,
            "Health monitor started"
        );

        loop {
            timer.tick().await;
            self.run_once().await;
        }
    }

    /// 1回分の再分類と再割り当て
    pub async fn run_once(&self) {
        let evicted = self.registry.sweep().await;
        for (worker_id, services) in &evicted {
            warn!(
                worker_id = %worker_id,
                services = ?services,
                "Worker evicted by health monitor"
            );
        }

        let assigned = self
            .registry
            .rebalance(&self.catalog, self.max_services_per_worker)
            .await;
        if assigned > 0 {
            info!(assignments = assigned, "Rebalance filled service gaps");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_common::{
        protocol::RegisterRequest,
        types::{default_catalog, Capabilities, NetworkAddress},
    };

    fn register_request() -> RegisterRequest {
        RegisterRequest {
            capabilities: Capabilities {
                cpu_cores: 4,
                ram_bytes: 8 * 1024 * 1024 * 1024,
                gpu_present: true,
                gpu_vram_bytes: Some(8 * 1024 * 1024 * 1024),
                disk_bytes: 64 * 1024 * 1024 * 1024,
                publicly_reachable: false,
            },
            network_address: NetworkAddress::Relay("192.168.1.100:7171".parse().unwrap()),
        }
    }

    #[tokio::test]
    async fn test_run_once_on_empty_registry() {
        let registry = WorkerRegistry::new(120, 600);
        let monitor = HealthMonitor::new(registry, Arc::new(default_catalog()), 30, 3);

        // ワーカーがいなくてもパニックしない
        monitor.run_once().await;
    }

    #[tokio::test]
    async fn test_run_once_keeps_fresh_worker() {
        let registry = WorkerRegistry::new(120, 600);
        let catalog = Arc::new(default_catalog());
        registry
            .register(register_request(), &catalog, 3)
            .await
            .unwrap();

        let monitor = HealthMonitor::new(registry.clone(), catalog, 30, 3);
        monitor.run_once().await;

        assert_eq!(registry.list().await.len(), 1);
    }

    #[tokio::test]
    async fn test_run_once_rebalances_gaps() {
        let registry = WorkerRegistry::new(120, 600);
        let catalog = Arc::new(default_catalog());

        // 上限1で登録 → 登録時の割り当ては1サービスのみ
        let response = registry
            .register(register_request(), &catalog, 1)
            .await
            .unwrap();
        assert_eq!(response.assigned_services.len(), 1);

        // モニター側は上限3で再割り当てする
        let monitor = HealthMonitor::new(registry.clone(), catalog, 30, 3);
        monitor.run_once().await;

        let worker = registry.get(response.worker_id).await.unwrap();
        assert_eq!(worker.assigned_services.len(), 3);
    }
}
