//! REST APIハンドラー
//!
//! ワーカー登録・ハートビート、管理系、サービスプロキシ、
//! オーバーレイブートストラップ、DHTシードAPI

pub mod dht;
pub mod overlay;
pub mod proxy;
pub mod worker;

use crate::AppState;
use axum::{
    routing::{any, get, post},
    Router,
};

/// APIルーターを作成
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/worker/register", post(worker::register_worker))
        .route("/worker/heartbeat", post(worker::heartbeat))
        .route("/worker/deregister", post(worker::deregister_worker))
        .route("/admin/workers", get(worker::list_workers))
        .route("/admin/gaps", get(worker::list_gaps))
        .route("/service/:service", any(proxy::proxy_service_root))
        .route("/service/:service/*rest", any(proxy::proxy_service))
        .route("/dht/seeds", get(dht::seeds))
        .route("/overlay/claim-bootstrap", post(overlay::claim_bootstrap))
        .route("/overlay/activate", post(overlay::activate_bootstrap))
        .route("/overlay/allocate", post(overlay::allocate))
        .route(
            "/overlay/entrypoints",
            post(overlay::append_entrypoint).get(overlay::list_entrypoints),
        )
        .with_state(state)
}
