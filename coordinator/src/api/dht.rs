//! DHTシードAPIハンドラー
//!
//! 現在健全なワーカーのピア情報を返し、DHTノードのブートストラップ
//! シードとして使わせる。シードの出所はレジストリそのもの。

use crate::AppState;
use axum::{extract::State, Json};
use fleet_common::{
    protocol::{DhtSeedsResponse, PeerInfo},
    types::peer_id_hex,
};

/// GET /dht/seeds - DHTブートストラップシード
pub async fn seeds(State(state): State<AppState>) -> Json<DhtSeedsResponse> {
    let seeds = state
        .registry
        .healthy()
        .await
        .iter()
        .map(|worker| PeerInfo {
            peer_id: peer_id_hex(&worker.id),
            address: worker.network_address.socket_addr(),
        })
        .collect();

    Json(DhtSeedsResponse { seeds })
}
