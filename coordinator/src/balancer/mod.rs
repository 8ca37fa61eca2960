//! プロキシ用ワーカー選択
//!
//! サービスを担当する健全なワーカーの中から転送先を選ぶ。
//! 方針: 最小負荷（最新ハートビートのload）優先、同負荷は
//! ラウンドロビンで決着。常に同じワーカーを選ばないこと。

use crate::registry::WorkerRegistry;
use fleet_common::{
    error::{CoordinatorError, CoordinatorResult},
    types::{ServiceHealth, Worker},
};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use uuid::Uuid;

/// 同負荷とみなす許容幅（パーセントポイント）
const LOAD_EPSILON: f32 = 5.0;

/// ワーカーセレクター
#[derive(Clone)]
pub struct WorkerSelector {
    registry: WorkerRegistry,
    round_robin: Arc<AtomicUsize>,
}

impl WorkerSelector {
    /// 新しいセレクターを作成
    pub fn new(registry: WorkerRegistry) -> Self {
        Self {
            registry,
            round_robin: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// サービスの転送先ワーカーを選択する
    ///
    /// `exclude`はリトライ時に直前の失敗ワーカーを避けるために使う。
    /// 適格なワーカーがいない場合は`NoWorkersAvailable`。
    pub async fn select(
        &self,
        service: &str,
        exclude: Option<Uuid>,
    ) -> CoordinatorResult<Worker> {
        let mut eligible: Vec<Worker> = self
            .registry
            .healthy()
            .await
            .into_iter()
            .filter(|w| w.assigned_services.contains(service))
            .filter(|w| {
                // ハートビートで異常が報告されたサービスには送らない。
                // 未報告（起動直後）はStarting扱いで許容する
                !matches!(w.service_health.get(service), Some(ServiceHealth::Unhealthy))
            })
            .filter(|w| Some(w.id) != exclude)
            .collect();

        if eligible.is_empty() {
            return Err(CoordinatorError::NoWorkersAvailable(service.to_string()));
        }

        eligible.sort_by(|a, b| {
            a.current_load
                .partial_cmp(&b.current_load)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });

        // 最小負荷と同等のワーカー群からラウンドロビンで選ぶ
        let min_load = eligible[0].current_load;
        let tied: Vec<Worker> = eligible
            .into_iter()
            .take_while(|w| w.current_load <= min_load + LOAD_EPSILON)
            .collect();

        let index = self
            .round_robin
            .fetch_add(1, Ordering::SeqCst)
            .rem_euclid(tied.len());
        Ok(tied[index].clone())
    }
}
