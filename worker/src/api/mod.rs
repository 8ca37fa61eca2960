//! ワーカーピアAPI
//!
//! 他ノードとCoordinatorから呼ばれるHTTPサーフェス。
//! DHT RPC、ライトハウスの証明書署名、ローカルサービスへの転送を提供する。

use crate::{dht::DhtNode, overlay::LighthouseSigner, supervisor::ServiceSupervisor};
use axum::{
    body::Body,
    extract::{Path, RawQuery, State},
    http::{header, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{any, get, post},
    Json, Router,
};
use fleet_common::protocol::{
    FindNodeRequest, FindProvidersRequest, SignRequest, SignResponse, StoreProviderRequest,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// ローカルサービス転送の最大ボディサイズ
const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

/// ローカルサービス転送のタイムアウト（秒）
const LOCAL_PROXY_TIMEOUT_SECS: u64 = 20;

/// ピアAPIの共有状態
#[derive(Clone)]
pub struct PeerApiState {
    /// DHTノード
    pub dht: DhtNode,
    /// ライトハウス署名器（このノードがライトハウスの場合のみ）
    pub signer: Option<Arc<LighthouseSigner>>,
    /// ローカルサービスのスーパーバイザー
    pub supervisor: ServiceSupervisor,
    /// 転送用HTTPクライアント
    pub http: reqwest::Client,
}

/// ピアAPIルーターを構築する
pub fn create_router(state: PeerApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/overlay/sign", post(sign_certificate))
        .route("/dht/find-node", post(dht_find_node))
        .route("/dht/store", post(dht_store))
        .route("/dht/find-providers", post(dht_find_providers))
        .route("/service/:service", any(proxy_local_root))
        .route("/service/:service/*rest", any(proxy_local))
        .with_state(state)
}

/// GET /health - 生存確認
async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/// POST /overlay/sign - 参加ノードのCSRに署名する（ライトハウス専用）
async fn sign_certificate(
    State(state): State<PeerApiState>,
    Json(request): Json<SignRequest>,
) -> Response {
    let Some(signer) = &state.signer else {
        return (
            StatusCode::CONFLICT,
            Json(json!({ "error": { "type": "not_lighthouse", "message": "this node is not the lighthouse" } })),
        )
            .into_response();
    };

    match signer.sign(&request.csr_pem, request.overlay_address) {
        Ok(certificate_pem) => Json(SignResponse { certificate_pem }).into_response(),
        Err(error) => {
            warn!("Certificate signing failed: {}", error);
            (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": { "type": "invalid_csr", "message": error.to_string() } })),
            )
                .into_response()
        }
    }
}

/// POST /dht/find-node
async fn dht_find_node(
    State(state): State<PeerApiState>,
    Json(request): Json<FindNodeRequest>,
) -> Response {
    Json(state.dht.handle_find_node(request).await).into_response()
}

/// POST /dht/store
async fn dht_store(
    State(state): State<PeerApiState>,
    Json(request): Json<StoreProviderRequest>,
) -> StatusCode {
    state.dht.handle_store(request).await;
    StatusCode::NO_CONTENT
}

/// POST /dht/find-providers
async fn dht_find_providers(
    State(state): State<PeerApiState>,
    Json(request): Json<FindProvidersRequest>,
) -> Response {
    Json(state.dht.handle_find_providers(request).await).into_response()
}

/// ANY /service/:service - ルートパスへの転送
async fn proxy_local_root(
    State(state): State<PeerApiState>,
    Path(service): Path<String>,
    RawQuery(query): RawQuery,
    method: Method,
    headers: HeaderMap,
    body: Body,
) -> Response {
    forward_local(state, service, String::new(), query, method, headers, body).await
}

/// ANY /service/:service/*rest - ローカルサービスへの転送
async fn proxy_local(
    State(state): State<PeerApiState>,
    Path((service, rest)): Path<(String, String)>,
    RawQuery(query): RawQuery,
    method: Method,
    headers: HeaderMap,
    body: Body,
) -> Response {
    forward_local(state, service, rest, query, method, headers, body).await
}

async fn forward_local(
    state: PeerApiState,
    service: String,
    rest: String,
    query: Option<String>,
    method: Method,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let Some(port) = state.supervisor.is_managed(&service).await else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": { "type": "service_not_hosted", "message": format!("service {} is not hosted here", service) } })),
        )
            .into_response();
    };

    let body_bytes = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return (StatusCode::PAYLOAD_TOO_LARGE, "request body too large").into_response();
        }
    };

    let query_suffix = query.map(|q| format!("?{}", q)).unwrap_or_default();
    let url = format!("http://127.0.0.1:{}/{}{}", port, rest, query_suffix);

    let mut request = state
        .http
        .request(method, &url)
        .timeout(Duration::from_secs(LOCAL_PROXY_TIMEOUT_SECS))
        .body(body_bytes);
    for (name, value) in headers.iter() {
        if name != header::HOST && name != header::CONTENT_LENGTH {
            request = request.header(name, value);
        }
    }

    match request.send().await {
        Ok(upstream) => {
            let status = upstream.status();
            let mut response_headers = HeaderMap::new();
            for (name, value) in upstream.headers() {
                if name != header::CONTENT_LENGTH && name != header::TRANSFER_ENCODING {
                    response_headers.insert(name.clone(), value.clone());
                }
            }
            match upstream.bytes().await {
                Ok(bytes) => (status, response_headers, bytes).into_response(),
                Err(error) => {
                    warn!("Failed reading local service response: {}", error);
                    (StatusCode::BAD_GATEWAY, "upstream read failed").into_response()
                }
            }
        }
        Err(error) => {
            warn!("Local service {} unreachable: {}", service, error);
            (StatusCode::BAD_GATEWAY, "local service unreachable").into_response()
        }
    }
}
