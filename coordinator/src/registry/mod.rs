//! ワーカーレジストリ
//!
//! ワーカーレコードをメモリ内で管理する、クラスターの登録台帳。
//! レコードの変更はすべてマップの書き込みロック配下で行い、
//! ヘルス分類と割り当てが更新消失なく直列化される（単一ライター規律）。

use chrono::Utc;
use fleet_common::{
    error::{CoordinatorError, CoordinatorResult},
    protocol::{HeartbeatRequest, HeartbeatResponse, RegisterRequest, RegisterResponse},
    types::{ServiceType, Worker, WorkerStatus},
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::scheduler;

/// ハートビート経過時間からワーカー状態を分類する純関数
///
/// `None`はレコードの削除（`t_dead`超過）を意味する。状態遷移は
/// 経過時間の単調関数であり、ワーカーが自身をhealthyと宣言する
/// 経路は存在しない。
pub fn classify(age_secs: i64, t_healthy_secs: u64, t_dead_secs: u64) -> Option<WorkerStatus> {
    if age_secs < t_healthy_secs as i64 {
        Some(WorkerStatus::Healthy)
    } else if age_secs < t_dead_secs as i64 {
        Some(WorkerStatus::Degraded)
    } else {
        None
    }
}

/// ワーカーレジストリ
#[derive(Clone)]
pub struct WorkerRegistry {
    workers: Arc<RwLock<HashMap<Uuid, Worker>>>,
    t_healthy_secs: u64,
    t_dead_secs: u64,
}

impl WorkerRegistry {
    /// 新しいレジストリを作成
    pub fn new(t_healthy_secs: u64, t_dead_secs: u64) -> Self {
        Self {
            workers: Arc::new(RwLock::new(HashMap::new())),
            t_healthy_secs,
            t_dead_secs,
        }
    }

    /// ワーカーを登録
    ///
    /// IDはここで新規に割り当てる。クライアントがIDを持ち込む経路はない。
    /// 初期割り当ては同じ書き込みロック内で計算するため、同時登録が
    /// 同一ギャップ枠を二重に埋めることはない。
    pub async fn register(
        &self,
        req: RegisterRequest,
        catalog: &[ServiceType],
        max_services_per_worker: usize,
    ) -> CoordinatorResult<RegisterResponse> {
        req.capabilities.validate().map_err(CoordinatorError::Common)?;

        let mut workers = self.workers.write().await;

        let worker_id = Uuid::new_v4();
        let now = Utc::now();
        let mut worker = Worker {
            id: worker_id,
            capabilities: req.capabilities,
            network_address: req.network_address,
            assigned_services: BTreeSet::new(),
            status: WorkerStatus::Healthy,
            registered_at: now,
            last_heartbeat: now,
            current_load: 0.0,
            service_health: BTreeMap::new(),
        };

        let assigned = scheduler::assign_gaps_to_worker(
            &workers,
            &mut worker,
            catalog,
            max_services_per_worker,
        );
        workers.insert(worker_id, worker);

        info!(
            worker_id = %worker_id,
            assigned = ?assigned,
            "Worker registered"
        );

        Ok(RegisterResponse {
            worker_id,
            assigned_services: assigned,
        })
    }

    /// ハートビートを処理
    ///
    /// 未知のIDは`WorkerNotFound`（HTTP 404）となり、呼び出し側に
    /// 完全な再登録を要求する。`status_hint`は参考情報に留め、
    /// 時刻ベースの分類を上書きしない。
    pub async fn heartbeat(&self, req: HeartbeatRequest) -> CoordinatorResult<HeartbeatResponse> {
        let mut workers = self.workers.write().await;

        let worker = workers
            .get_mut(&req.worker_id)
            .ok_or(CoordinatorError::WorkerNotFound(req.worker_id))?;

        worker.last_heartbeat = Utc::now();
        worker.current_load = req.load.clamp(0.0, 100.0);
        worker.service_health = req.local_service_health;
        worker.status = WorkerStatus::Healthy;

        Ok(HeartbeatResponse {
            assigned_services: worker.assigned_services.iter().cloned().collect(),
        })
    }

    /// 全レコードを再分類し、`t_dead`超過レコードを削除する
    ///
    /// 削除されたワーカーの割り当てサービスを返す。これらは次回の
    /// ギャップ計算で再び不足分として現れる。
    pub async fn sweep(&self) -> Vec<(Uuid, BTreeSet<String>)> {
        let mut workers = self.workers.write().await;
        let now = Utc::now();
        let mut evicted = Vec::new();

        workers.retain(|id, worker| {
            let age = now.signed_duration_since(worker.last_heartbeat).num_seconds();
            match classify(age, self.t_healthy_secs, self.t_dead_secs) {
                Some(status) => {
                    if worker.status != status {
                        info!(worker_id = %id, ?status, age_secs = age, "Worker reclassified");
                    }
                    worker.status = status;
                    true
                }
                None => {
                    warn!(
                        worker_id = %id,
                        age_secs = age,
                        services = ?worker.assigned_services,
                        "Worker evicted, returning services to gap pool"
                    );
                    evicted.push((*id, worker.assigned_services.clone()));
                    false
                }
            }
        });

        evicted
    }

    /// ギャップを既存の適格ワーカーに再割り当てする
    pub async fn rebalance(
        &self,
        catalog: &[ServiceType],
        max_services_per_worker: usize,
    ) -> usize {
        let mut workers = self.workers.write().await;
        scheduler::assign_gaps(&mut workers, catalog, max_services_per_worker)
    }

    /// 現在のギャップを計算する（読み取りスナップショット）
    pub async fn gaps(&self, catalog: &[ServiceType]) -> Vec<fleet_common::protocol::GapReport> {
        let workers = self.workers.read().await;
        scheduler::service_gaps(&workers, catalog)
    }

    /// ワーカーを取得
    pub async fn get(&self, worker_id: Uuid) -> CoordinatorResult<Worker> {
        let workers = self.workers.read().await;
        workers
            .get(&worker_id)
            .cloned()
            .ok_or(CoordinatorError::WorkerNotFound(worker_id))
    }

    /// 全ワーカーのスナップショットを取得
    pub async fn list(&self) -> Vec<Worker> {
        let workers = self.workers.read().await;
        workers.values().cloned().collect()
    }

    /// 健全なワーカーのみ取得
    pub async fn healthy(&self) -> Vec<Worker> {
        let workers = self.workers.read().await;
        workers
            .values()
            .filter(|w| w.status == WorkerStatus::Healthy)
            .cloned()
            .collect()
    }

    /// ワーカーを削除（登録解除）
    pub async fn remove(&self, worker_id: Uuid) -> CoordinatorResult<Worker> {
        let mut workers = self.workers.write().await;
        workers
            .remove(&worker_id)
            .ok_or(CoordinatorError::WorkerNotFound(worker_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use fleet_common::types::{default_catalog, Capabilities, NetworkAddress};

    fn register_request(gpu: bool) -> RegisterRequest {
        RegisterRequest {
            capabilities: Capabilities {
                cpu_cores: 8,
                ram_bytes: 16 * 1024 * 1024 * 1024,
                gpu_present: gpu,
                gpu_vram_bytes: gpu.then_some(8 * 1024 * 1024 * 1024),
                disk_bytes: 256 * 1024 * 1024 * 1024,
                publicly_reachable: false,
            },
            network_address: NetworkAddress::Relay("192.168.1.100:7171".parse().unwrap()),
        }
    }

    #[test]
    fn test_classify_boundaries() {
        // healthy ⟺ age < t_healthy
        assert_eq!(classify(0, 120, 600), Some(WorkerStatus::Healthy));
        assert_eq!(classify(119, 120, 600), Some(WorkerStatus::Healthy));
        // degraded ⟺ t_healthy <= age < t_dead
        assert_eq!(classify(120, 120, 600), Some(WorkerStatus::Degraded));
        assert_eq!(classify(599, 120, 600), Some(WorkerStatus::Degraded));
        // 削除 ⟺ age >= t_dead
        assert_eq!(classify(600, 120, 600), None);
        assert_eq!(classify(10_000, 120, 600), None);

        // Unreachableは分類からは生成されない（t_dead超過は削除になる）
        for age in [0, 119, 120, 599, 600, 10_000] {
            assert_ne!(classify(age, 120, 600), Some(WorkerStatus::Unreachable));
        }
    }

    #[test]
    fn test_classify_tolerates_clock_skew() {
        assert_eq!(classify(-5, 120, 600), Some(WorkerStatus::Healthy));
    }

    #[tokio::test]
    async fn test_register_allocates_server_side_id() {
        let registry = WorkerRegistry::new(120, 600);
        let catalog = default_catalog();

        let first = registry.register(register_request(true), &catalog, 3).await.unwrap();
        let second = registry.register(register_request(true), &catalog, 3).await.unwrap();

        assert_ne!(first.worker_id, second.worker_id);

        let worker = registry.get(first.worker_id).await.unwrap();
        assert_eq!(worker.status, WorkerStatus::Healthy);
    }

    #[tokio::test]
    async fn test_register_rejects_malformed_capabilities() {
        let registry = WorkerRegistry::new(120, 600);
        let catalog = default_catalog();

        let mut req = register_request(false);
        req.capabilities.cpu_cores = 0;

        let result = registry.register(req, &catalog, 3).await;
        assert!(matches!(result, Err(CoordinatorError::Common(_))));
    }

    #[tokio::test]
    async fn test_heartbeat_unknown_id_is_not_found() {
        let registry = WorkerRegistry::new(120, 600);

        // registerが返していない自己生成IDでのハートビートは拒否される
        let result = registry
            .heartbeat(HeartbeatRequest {
                worker_id: Uuid::new_v4(),
                status_hint: WorkerStatus::Healthy,
                load: 1.0,
                local_service_health: BTreeMap::new(),
            })
            .await;

        assert!(matches!(result, Err(CoordinatorError::WorkerNotFound(_))));
    }

    #[tokio::test]
    async fn test_register_then_heartbeat_roundtrip() {
        let registry = WorkerRegistry::new(120, 600);
        let catalog = default_catalog();

        let response = registry.register(register_request(true), &catalog, 3).await.unwrap();
        let heartbeat = registry
            .heartbeat(HeartbeatRequest {
                worker_id: response.worker_id,
                status_hint: WorkerStatus::Healthy,
                load: 42.0,
                local_service_health: BTreeMap::new(),
            })
            .await
            .unwrap();

        let mut expected = response.assigned_services.clone();
        expected.sort();
        assert_eq!(heartbeat.assigned_services, expected);

        let worker = registry.get(response.worker_id).await.unwrap();
        assert_eq!(worker.current_load, 42.0);
    }

    #[tokio::test]
    async fn test_status_hint_never_overrides_classification() {
        let registry = WorkerRegistry::new(120, 600);
        let catalog = default_catalog();

        let response = registry.register(register_request(false), &catalog, 3).await.unwrap();

        // 自己申告がunreachableでも時刻ベース分類はhealthyのまま
        registry
            .heartbeat(HeartbeatRequest {
                worker_id: response.worker_id,
                status_hint: WorkerStatus::Unreachable,
                load: 0.0,
                local_service_health: BTreeMap::new(),
            })
            .await
            .unwrap();

        let worker = registry.get(response.worker_id).await.unwrap();
        assert_eq!(worker.status, WorkerStatus::Healthy);
    }

    #[tokio::test]
    async fn test_sweep_degrades_then_evicts() {
        let registry = WorkerRegistry::new(120, 600);
        let catalog = default_catalog();
        let response = registry.register(register_request(true), &catalog, 3).await.unwrap();
        assert!(!response.assigned_services.is_empty());

        // last_heartbeatを直接巻き戻して経過時間を偽装する
        {
            let mut workers = registry.workers.write().await;
            let worker = workers.get_mut(&response.worker_id).unwrap();
            worker.last_heartbeat = Utc::now() - Duration::seconds(200);
        }
        let evicted = registry.sweep().await;
        assert!(evicted.is_empty());
        let worker = registry.get(response.worker_id).await.unwrap();
        assert_eq!(worker.status, WorkerStatus::Degraded);

        {
            let mut workers = registry.workers.write().await;
            let worker = workers.get_mut(&response.worker_id).unwrap();
            worker.last_heartbeat = Utc::now() - Duration::seconds(700);
        }
        let evicted = registry.sweep().await;
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].0, response.worker_id);
        assert!(!evicted[0].1.is_empty());
        assert!(registry.get(response.worker_id).await.is_err());

        // 削除されたワーカーのサービスはギャップとして再出現する
        let gaps = registry.gaps(&catalog).await;
        for service in &evicted[0].1 {
            assert!(gaps.iter().any(|g| &g.service.name == service));
        }
    }
}
