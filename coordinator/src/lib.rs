//! Fleet Coordinator Server
//!
//! ワーカーの登録台帳・ヘルス分類・サービス割り当て・リクエスト
//! プロキシを担う、クラスターの中央コントロールプレーン

#![warn(missing_docs)]

/// REST APIハンドラー
pub mod api;

/// プロキシ用ワーカー選択
pub mod balancer;

/// ヘルスモニター
pub mod health;

/// ロギング初期化
pub mod logging;

/// ワーカーレジストリ
pub mod registry;

/// サービススケジューラー
pub mod scheduler;

/// 共有KVストア
pub mod store;

use balancer::WorkerSelector;
use fleet_common::{config::CoordinatorConfig, types::ServiceType};
use registry::WorkerRegistry;
use std::sync::Arc;
use store::ClusterStore;

/// アプリケーション共有状態
#[derive(Clone)]
pub struct AppState {
    /// ワーカーレジストリ
    pub registry: WorkerRegistry,
    /// プロキシ用ワーカーセレクター
    pub selector: WorkerSelector,
    /// ブートストラップレコード・エントリーポイントの永続ストア
    pub store: ClusterStore,
    /// サービスカタログ
    pub catalog: Arc<Vec<ServiceType>>,
    /// Coordinator設定
    pub config: CoordinatorConfig,
    /// 共有HTTPクライアント
    pub http: reqwest::Client,
}
