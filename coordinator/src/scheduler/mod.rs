//! サービススケジューラー
//!
//! ギャップ計算（目標レプリカ数に満たないサービス種別の検出）と、
//! 能力要件を満たすワーカーへの割り当て。呼び出し側がレジストリの
//! 書き込みロックを保持している前提で動く同期関数群。

use fleet_common::{
    protocol::GapReport,
    types::{ServiceType, Worker, WorkerStatus},
};
use std::collections::HashMap;
use tracing::debug;
use uuid::Uuid;

/// サービス種別ごとの健全レプリカ数を数える
fn healthy_replicas(workers: &HashMap<Uuid, Worker>, service: &ServiceType) -> u32 {
    workers
        .values()
        .filter(|w| w.status == WorkerStatus::Healthy && w.assigned_services.contains(&service.name))
        .count() as u32
}

/// 現在のギャップ（不足レプリカ）を計算する
pub fn service_gaps(workers: &HashMap<Uuid, Worker>, catalog: &[ServiceType]) -> Vec<GapReport> {
    catalog
        .iter()
        .filter_map(|service| {
            let healthy = healthy_replicas(workers, service);
            if healthy < service.desired_replicas {
                Some(GapReport {
                    service: service.clone(),
                    healthy_replicas: healthy,
                    missing: service.desired_replicas - healthy,
                })
            } else {
                None
            }
        })
        .collect()
}

/// 登録直後のワーカーにギャップを割り当てる
///
/// 能力要件を満たさないサービスは黙ってスキップする（ワーカー側の
/// エラーではない）。同時割り当て上限まで埋める。
pub fn assign_gaps_to_worker(
    workers: &HashMap<Uuid, Worker>,
    worker: &mut Worker,
    catalog: &[ServiceType],
    max_services_per_worker: usize,
) -> Vec<String> {
    let mut assigned = Vec::new();

    for gap in service_gaps(workers, catalog) {
        if worker.assigned_services.len() >= max_services_per_worker {
            break;
        }
        if !worker.satisfies(&gap.service) {
            debug!(
                worker_id = %worker.id,
                service = %gap.service.name,
                "Capability mismatch, skipping service"
            );
            continue;
        }
        if worker.assigned_services.insert(gap.service.name.clone()) {
            assigned.push(gap.service.name);
        }
    }

    assigned
}

/// ギャップを既存ワーカー群に割り当てる
///
/// 各ギャップについて、割り当て数が最少の適格かつ健全なワーカーから
/// 順に埋めていく。行った割り当ての総数を返す。
pub fn assign_gaps(
    workers: &mut HashMap<Uuid, Worker>,
    catalog: &[ServiceType],
    max_services_per_worker: usize,
) -> usize {
    let mut assignments = 0;

    for service in catalog {
        loop {
            let healthy = healthy_replicas(workers, service);
            if healthy >= service.desired_replicas {
                break;
            }

            // 適格: 健全・能力要件充足・未割り当て・上限未満
            let mut candidates: Vec<&Worker> = workers
                .values()
                .filter(|w| {
                    w.status == WorkerStatus::Healthy
                        && w.satisfies(service)
                        && !w.assigned_services.contains(&service.name)
                        && w.assigned_services.len() < max_services_per_worker
                })
                .collect();

            if candidates.is_empty() {
                break;
            }

            // 割り当て最少のワーカーを優先し、同数ならIDで決定的に
            candidates.sort_by_key(|w| (w.assigned_services.len(), w.id));
            let target = candidates[0].id;

            if let Some(worker) = workers.get_mut(&target) {
                worker.assigned_services.insert(service.name.clone());
                assignments += 1;
                debug!(worker_id = %target, service = %service.name, "Gap assigned");
            }
        }
    }

    assignments
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use fleet_common::types::{Capabilities, NetworkAddress};
    use std::collections::{BTreeMap, BTreeSet};

    fn worker(gpu: bool) -> Worker {
        Worker {
            id: Uuid::new_v4(),
            capabilities: Capabilities {
                cpu_cores: 4,
                ram_bytes: 16 * 1024 * 1024 * 1024,
                gpu_present: gpu,
                gpu_vram_bytes: gpu.then_some(8 * 1024 * 1024 * 1024),
                disk_bytes: 128 * 1024 * 1024 * 1024,
                publicly_reachable: false,
            },
            network_address: NetworkAddress::Relay("127.0.0.1:7171".parse().unwrap()),
            assigned_services: BTreeSet::new(),
            status: WorkerStatus::Healthy,
            registered_at: Utc::now(),
            last_heartbeat: Utc::now(),
            current_load: 0.0,
            service_health: BTreeMap::new(),
        }
    }

    fn catalog() -> Vec<ServiceType> {
        vec![
            ServiceType {
                name: "doc-ocr".to_string(),
                requires_gpu: true,
                desired_replicas: 2,
                port: 17021,
            },
            ServiceType {
                name: "note-convert".to_string(),
                requires_gpu: false,
                desired_replicas: 2,
                port: 17023,
            },
        ]
    }

    #[test]
    fn test_gaps_on_empty_registry() {
        let workers = HashMap::new();
        let gaps = service_gaps(&workers, &catalog());

        assert_eq!(gaps.len(), 2);
        assert!(gaps.iter().all(|g| g.healthy_replicas == 0));
        assert_eq!(gaps.iter().map(|g| g.missing).sum::<u32>(), 4);
    }

    #[test]
    fn test_gpu_service_never_assigned_to_gpu_less_worker() {
        let workers = HashMap::new();
        let mut cpu_only = worker(false);

        let assigned = assign_gaps_to_worker(&workers, &mut cpu_only, &catalog(), 3);

        assert_eq!(assigned, vec!["note-convert".to_string()]);
        assert!(!cpu_only.assigned_services.contains("doc-ocr"));
    }

    #[test]
    fn test_assignment_respects_per_worker_limit() {
        let workers = HashMap::new();
        let mut gpu = worker(true);

        let assigned = assign_gaps_to_worker(&workers, &mut gpu, &catalog(), 1);

        assert_eq!(assigned.len(), 1);
        assert_eq!(gpu.assigned_services.len(), 1);
    }

    #[test]
    fn test_rebalance_converges_to_min_replicas_workers() {
        // desired_replicas=2、適格ワーカー3台 → 各サービス2レプリカで収束
        let mut workers = HashMap::new();
        for _ in 0..3 {
            let w = worker(true);
            workers.insert(w.id, w);
        }

        let assigned = assign_gaps(&mut workers, &catalog(), 3);
        assert_eq!(assigned, 4);

        for service in catalog() {
            let replicas = workers
                .values()
                .filter(|w| w.assigned_services.contains(&service.name))
                .count() as u32;
            assert_eq!(replicas, service.desired_replicas);
        }

        // 収束後の再実行は何もしない
        assert_eq!(assign_gaps(&mut workers, &catalog(), 3), 0);
    }

    #[test]
    fn test_rebalance_with_fewer_workers_than_replicas() {
        // 適格ワーカー1台 → min(k, W) = 1 レプリカで止まる
        let mut workers = HashMap::new();
        let w = worker(true);
        workers.insert(w.id, w);

        assign_gaps(&mut workers, &catalog(), 3);

        for service in catalog() {
            let replicas = workers
                .values()
                .filter(|w| w.assigned_services.contains(&service.name))
                .count();
            assert_eq!(replicas, 1);
        }
    }

    #[test]
    fn test_rebalance_skips_degraded_workers() {
        let mut workers = HashMap::new();
        let mut degraded = worker(true);
        degraded.status = WorkerStatus::Degraded;
        workers.insert(degraded.id, degraded);

        assert_eq!(assign_gaps(&mut workers, &catalog(), 3), 0);
        assert!(workers.values().all(|w| w.assigned_services.is_empty()));
    }

    #[test]
    fn test_rebalance_spreads_across_workers() {
        let mut workers = HashMap::new();
        for _ in 0..4 {
            let w = worker(true);
            workers.insert(w.id, w);
        }

        assign_gaps(&mut workers, &catalog(), 3);

        // 1台に全部ではなく、割り当て最少のワーカーから埋める
        let max_on_one = workers
            .values()
            .map(|w| w.assigned_services.len())
            .max()
            .unwrap();
        assert!(max_on_one <= 1, "assignments not spread: {}", max_on_one);
    }
}
