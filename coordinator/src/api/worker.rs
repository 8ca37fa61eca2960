//! ワーカー登録・ハートビートAPIハンドラー

use crate::AppState;
use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use fleet_common::{
    error::CoordinatorError,
    protocol::{
        DeregisterRequest, GapReport, HeartbeatRequest, HeartbeatResponse, RegisterRequest,
        RegisterResponse,
    },
    types::Worker,
};
use serde_json::json;

/// POST /worker/register - ワーカー登録
///
/// IDの割り当てと初期割り当ての計算はレジストリが行う。
pub async fn register_worker(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<Json<RegisterResponse>, AppError> {
    let response = state
        .registry
        .register(req, &state.catalog, state.config.max_services_per_worker)
        .await?;
    Ok(Json(response))
}

/// POST /worker/heartbeat - ハートビート受信
///
/// 未知のIDには404を返し、呼び出し側に再登録を促す。
pub async fn heartbeat(
    State(state): State<AppState>,
    Json(req): Json<HeartbeatRequest>,
) -> Result<Json<HeartbeatResponse>, AppError> {
    let response = state.registry.heartbeat(req).await?;
    Ok(Json(response))
}

/// POST /worker/deregister - 登録解除（ベストエフォート）
pub async fn deregister_worker(
    State(state): State<AppState>,
    Json(req): Json<DeregisterRequest>,
) -> Result<StatusCode, AppError> {
    state.registry.remove(req.worker_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /admin/workers - ワーカー一覧（診断用）
pub async fn list_workers(State(state): State<AppState>) -> Json<Vec<Worker>> {
    let workers = state.registry.list().await;
    Json(workers)
}

/// GET /admin/gaps - 不足レプリカ一覧（診断用）
pub async fn list_gaps(State(state): State<AppState>) -> Json<Vec<GapReport>> {
    let gaps = state.registry.gaps(&state.catalog).await;
    Json(gaps)
}

/// Axum用のエラーレスポンス型
#[derive(Debug)]
pub struct AppError(pub CoordinatorError);

impl From<CoordinatorError> for AppError {
    fn from(err: CoordinatorError) -> Self {
        AppError(err)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, kind) = match &self.0 {
            CoordinatorError::WorkerNotFound(_) => (StatusCode::NOT_FOUND, "worker_not_found"),
            // 適格ワーカー不在はルーティングバグと区別できるボディで503を返す
            CoordinatorError::NoWorkersAvailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "no_eligible_worker")
            }
            CoordinatorError::BootstrapConflict(_) => (StatusCode::CONFLICT, "bootstrap_conflict"),
            CoordinatorError::BootstrapNotActive(_) => {
                (StatusCode::CONFLICT, "bootstrap_not_active")
            }
            CoordinatorError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "store_error"),
            CoordinatorError::Http(_) => (StatusCode::BAD_GATEWAY, "upstream_error"),
            CoordinatorError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, "upstream_timeout"),
            CoordinatorError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
            CoordinatorError::Common(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
        };

        let payload = json!({
            "error": {
                "type": kind,
                "message": self.0.to_string(),
            }
        });

        (status, Json(payload)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{balancer::WorkerSelector, registry::WorkerRegistry, store::ClusterStore};
    use fleet_common::{
        config::CoordinatorConfig,
        types::{default_catalog, Capabilities, NetworkAddress},
    };
    use std::sync::Arc;

    async fn create_test_state() -> (tempfile::TempDir, AppState) {
        let dir = tempfile::tempdir().unwrap();
        let store = ClusterStore::open_at(dir.path().join("cluster.json"))
            .await
            .unwrap();
        let registry = WorkerRegistry::new(120, 600);
        let state = AppState {
            selector: WorkerSelector::new(registry.clone()),
            registry,
            store,
            catalog: Arc::new(default_catalog()),
            config: CoordinatorConfig::default(),
            http: reqwest::Client::new(),
        };
        (dir, state)
    }

    fn register_request() -> RegisterRequest {
        RegisterRequest {
            capabilities: Capabilities {
                cpu_cores: 8,
                ram_bytes: 16 * 1024 * 1024 * 1024,
                gpu_present: false,
                gpu_vram_bytes: None,
                disk_bytes: 128 * 1024 * 1024 * 1024,
                publicly_reachable: false,
            },
            network_address: NetworkAddress::Relay("192.168.1.100:7171".parse().unwrap()),
        }
    }

    #[tokio::test]
    async fn test_register_worker_success() {
        let (_dir, state) = create_test_state().await;

        let result = register_worker(State(state), Json(register_request())).await;
        assert!(result.is_ok());

        let response = result.unwrap().0;
        assert!(!response.worker_id.to_string().is_empty());
        // GPUなしワーカーにGPU必須サービスは割り当てられない
        assert!(!response.assigned_services.iter().any(|s| s == "doc-ocr"));
    }

    #[tokio::test]
    async fn test_list_workers_empty() {
        let (_dir, state) = create_test_state().await;
        let result = list_workers(State(state)).await;
        assert_eq!(result.0.len(), 0);
    }

    #[tokio::test]
    async fn test_list_gaps_reflects_catalog() {
        let (_dir, state) = create_test_state().await;
        let result = list_gaps(State(state)).await;

        // ワーカー不在なら全サービスがギャップ
        assert_eq!(result.0.len(), default_catalog().len());
    }

    #[tokio::test]
    async fn test_error_mapping_distinguishes_unavailable() {
        let not_found = AppError(CoordinatorError::WorkerNotFound(uuid::Uuid::new_v4()));
        let response = not_found.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let unavailable = AppError(CoordinatorError::NoWorkersAvailable("doc-ocr".to_string()));
        let response = unavailable.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
