//! オーバーレイブートストラップAPIハンドラー
//!
//! クレーム（初回ノード選出）、ライトハウス有効化、アドレス割り当て
//! +証明書発行、エントリーポイント管理

use crate::{api::worker::AppError, AppState};
use axum::{extract::State, Json};
use fleet_common::{
    error::CoordinatorError,
    protocol::{
        ActivateBootstrapRequest, AllocateRequest, AllocateResponse, ClaimBootstrapRequest,
        ClaimBootstrapResponse, EntryPointRequest, SignRequest, SignResponse,
    },
    types::{BootstrapRecord, BootstrapStatus, EntryPoint},
};
use std::time::Duration;
use tracing::info;

/// POST /overlay/claim-bootstrap - ブートストラップレコードのクレーム
///
/// 不在時のみ作成（冪等）。作成できた呼び出し元がライトハウスになり、
/// それ以外は既存レコードを読んで参加側経路に進む。
pub async fn claim_bootstrap(
    State(state): State<AppState>,
    Json(req): Json<ClaimBootstrapRequest>,
) -> Result<Json<ClaimBootstrapResponse>, AppError> {
    let (claimed, record) = state
        .store
        .claim_bootstrap(req.lighthouse_address, &state.config.network_prefix)
        .await?;

    if claimed {
        info!(lighthouse = %req.lighthouse_address, "First-node election won");
    }

    Ok(Json(ClaimBootstrapResponse { claimed, record }))
}

/// POST /overlay/activate - ライトハウス有効化
pub async fn activate_bootstrap(
    State(state): State<AppState>,
    Json(req): Json<ActivateBootstrapRequest>,
) -> Result<Json<BootstrapRecord>, AppError> {
    let record = state.store.activate_bootstrap(req).await?;
    Ok(Json(record))
}

/// POST /overlay/allocate - アドレス割り当て+証明書発行
///
/// アドレスの採番と署名要求の転送を一続きに行う。CA秘密鍵は
/// ライトハウスだけが開封できるため、ここで鍵素材に触れることはない。
pub async fn allocate(
    State(state): State<AppState>,
    Json(req): Json<AllocateRequest>,
) -> Result<Json<AllocateResponse>, AppError> {
    let record = state
        .store
        .bootstrap()
        .await
        .ok_or_else(|| CoordinatorError::BootstrapNotActive("no bootstrap record".to_string()))?;

    if record.status != BootstrapStatus::Active {
        return Err(CoordinatorError::BootstrapNotActive(
            "bootstrap record is pending".to_string(),
        )
        .into());
    }

    let ca_cert_pem = record.ca_cert_pem.clone().ok_or_else(|| {
        CoordinatorError::Internal("active bootstrap record without CA certificate".to_string())
    })?;

    let address = state.store.allocate_ip().await?;

    // ライトハウスの署名エンドポイントへCSRを転送
    let sign_url = format!("http://{}/overlay/sign", record.lighthouse_address);
    let response = state
        .http
        .post(&sign_url)
        .timeout(Duration::from_secs(state.config.proxy_timeout_secs))
        .json(&SignRequest {
            csr_pem: req.csr_pem,
            overlay_address: address,
        })
        .send()
        .await
        .map_err(|e| {
            if e.is_timeout() {
                CoordinatorError::Timeout(format!("Lighthouse signing timed out: {}", e))
            } else {
                CoordinatorError::Http(format!("Failed to reach lighthouse signer: {}", e))
            }
        })?;

    if !response.status().is_success() {
        return Err(CoordinatorError::Http(format!(
            "Lighthouse signing failed with status: {}",
            response.status()
        ))
        .into());
    }

    let signed = response
        .json::<SignResponse>()
        .await
        .map_err(|e| CoordinatorError::Http(format!("Failed to parse signing response: {}", e)))?;

    info!(address = %address, "Overlay address allocated and certificate issued");

    Ok(Json(AllocateResponse {
        address,
        certificate_pem: signed.certificate_pem,
        ca_cert_pem,
    }))
}

/// POST /overlay/entrypoints - エントリーポイント追記
pub async fn append_entrypoint(
    State(state): State<AppState>,
    Json(req): Json<EntryPointRequest>,
) -> Result<Json<Vec<EntryPoint>>, AppError> {
    state.store.append_entrypoint(req.worker_id, req.address).await?;
    Ok(Json(state.store.entrypoints().await))
}

/// GET /overlay/entrypoints - エントリーポイント一覧
pub async fn list_entrypoints(State(state): State<AppState>) -> Json<Vec<EntryPoint>> {
    Json(state.store.entrypoints().await)
}
