//! DHTノード
//!
//! ルーティングテーブルと提供者レコードストアを保持し、ピアAPI経由の
//! 反復検索・告知を行う。Coordinator経由のシードでブートストラップする。

use super::{NodeId, RoutingTable, ALPHA, BUCKET_SIZE};
use fleet_common::{
    error::{WorkerError, WorkerResult},
    protocol::{
        FindNodeRequest, FindNodeResponse, FindProvidersRequest, FindProvidersResponse, PeerInfo,
        ProviderRecord, StoreProviderRequest,
    },
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// 1ピアあたりのRPCタイムアウト
const RPC_TIMEOUT_SECS: u64 = 5;

/// キーあたりの提供者レコード上限
const MAX_PROVIDERS_PER_KEY: usize = 32;

struct DhtState {
    table: RoutingTable,
    providers: HashMap<String, Vec<ProviderRecord>>,
}

/// DHTノード
#[derive(Clone)]
pub struct DhtNode {
    own: PeerInfo,
    own_id: NodeId,
    state: Arc<Mutex<DhtState>>,
    http: reqwest::Client,
}

impl DhtNode {
    /// 自ピア情報からノードを作成
    pub fn new(own: PeerInfo) -> WorkerResult<Self> {
        let own_id = NodeId::from_hex(&own.peer_id)
            .ok_or_else(|| WorkerError::Dht(format!("invalid own peer id: {}", own.peer_id)))?;
        Ok(Self {
            own_id,
            own,
            state: Arc::new(Mutex::new(DhtState {
                table: RoutingTable::new(own_id),
                providers: HashMap::new(),
            })),
            http: reqwest::Client::new(),
        })
    }

    /// 自ピア情報
    pub fn own_peer(&self) -> &PeerInfo {
        &self.own
    }

    /// 既知ピア数
    pub async fn peer_count(&self) -> usize {
        self.state.lock().await.table.len()
    }

    /// シードからブートストラップする
    ///
    /// シードを取り込んだ後、自IDの反復検索でテーブルを温める。
    pub async fn bootstrap(&self, seeds: Vec<PeerInfo>) {
        {
            let mut state = self.state.lock().await;
            for seed in seeds {
                if seed.peer_id != self.own.peer_id {
                    state.table.insert(seed);
                }
            }
        }
        let discovered = self.iterative_find_node(self.own_id).await;
        debug!("DHT bootstrap complete: {} peers discovered", discovered.len());
    }

    /// 反復find-node検索
    ///
    /// 各ラウンドで未照会の最近傍ALPHA件を問い合わせ、より近いピアが
    /// 見つからなくなったら終了する。到達不能なピアはテーブルから外す。
    pub async fn iterative_find_node(&self, target: NodeId) -> Vec<PeerInfo> {
        let mut queried: HashSet<String> = HashSet::new();

        loop {
            let candidates = {
                let state = self.state.lock().await;
                state.table.closest(&target, BUCKET_SIZE)
            };
            let round: Vec<PeerInfo> = candidates
                .iter()
                .filter(|p| !queried.contains(&p.peer_id))
                .take(ALPHA)
                .cloned()
                .collect();
            if round.is_empty() {
                return candidates;
            }

            for peer in round {
                queried.insert(peer.peer_id.clone());
                match self.rpc_find_node(&peer, &target).await {
                    Ok(closer) => {
                        let mut state = self.state.lock().await;
                        for found in closer {
                            if found.peer_id != self.own.peer_id {
                                state.table.insert(found);
                            }
                        }
                    }
                    Err(error) => {
                        debug!("DHT peer {} unreachable: {}", peer.address, error);
                        self.state.lock().await.table.remove(&peer.peer_id);
                    }
                }
            }
        }
    }

    /// サービス提供を告知する
    ///
    /// キーに最も近い既知ピアへレコードを複製する。ローカルにも保存する
    /// ので、孤立ノードでも自分の提供分は answer できる。
    pub async fn announce(&self, service: &str) {
        let key = NodeId::from_key(service);
        let record = ProviderRecord {
            service: service.to_string(),
            peer_id: self.own.peer_id.clone(),
            address: self.own.address,
        };

        self.store_local(&key.to_hex(), record.clone()).await;

        let targets = self.iterative_find_node(key).await;
        let request = StoreProviderRequest {
            key: key.to_hex(),
            provider: record,
            from: self.own.clone(),
        };
        for peer in targets.iter().take(ALPHA) {
            if let Err(error) = self.rpc_store(peer, &request).await {
                warn!("DHT store to {} failed: {}", peer.address, error);
            }
        }
    }

    /// サービス提供者を検索する
    pub async fn find_providers(&self, service: &str) -> Vec<ProviderRecord> {
        let key = NodeId::from_key(service);
        let key_hex = key.to_hex();

        let mut found: Vec<ProviderRecord> = {
            let state = self.state.lock().await;
            state.providers.get(&key_hex).cloned().unwrap_or_default()
        };

        let peers = self.iterative_find_node(key).await;
        for peer in peers.iter().take(ALPHA) {
            match self.rpc_find_providers(peer, &key_hex).await {
                Ok(response) => {
                    for record in response.providers {
                        if !found.iter().any(|r| r.peer_id == record.peer_id) {
                            found.push(record);
                        }
                    }
                }
                Err(error) => {
                    debug!("DHT find-providers at {} failed: {}", peer.address, error);
                }
            }
        }
        found
    }

    /// 受信したfind-nodeを処理する
    pub async fn handle_find_node(&self, request: FindNodeRequest) -> FindNodeResponse {
        let target = NodeId::from_hex(&request.target).unwrap_or(self.own_id);
        let mut state = self.state.lock().await;
        if request.from.peer_id != self.own.peer_id {
            state.table.insert(request.from);
        }
        FindNodeResponse {
            closer: state.table.closest(&target, BUCKET_SIZE),
        }
    }

    /// 受信したstoreを処理する
    pub async fn handle_store(&self, request: StoreProviderRequest) {
        {
            let mut state = self.state.lock().await;
            if request.from.peer_id != self.own.peer_id {
                state.table.insert(request.from);
            }
        }
        self.store_local(&request.key, request.provider).await;
    }

    /// 受信したfind-providersを処理する
    pub async fn handle_find_providers(
        &self,
        request: FindProvidersRequest,
    ) -> FindProvidersResponse {
        let target = NodeId::from_hex(&request.key).unwrap_or(self.own_id);
        let mut state = self.state.lock().await;
        if request.from.peer_id != self.own.peer_id {
            state.table.insert(request.from);
        }
        FindProvidersResponse {
            providers: state.providers.get(&request.key).cloned().unwrap_or_default(),
            closer: state.table.closest(&target, BUCKET_SIZE),
        }
    }

    async fn store_local(&self, key: &str, record: ProviderRecord) {
        let mut state = self.state.lock().await;
        let records = state.providers.entry(key.to_string()).or_default();
        if let Some(existing) = records.iter_mut().find(|r| r.peer_id == record.peer_id) {
            *existing = record;
        } else if records.len() < MAX_PROVIDERS_PER_KEY {
            records.push(record);
        }
    }

    async fn rpc_find_node(
        &self,
        peer: &PeerInfo,
        target: &NodeId,
    ) -> WorkerResult<Vec<PeerInfo>> {
        let url = format!("http://{}/dht/find-node", peer.address);
        let request = FindNodeRequest {
            target: target.to_hex(),
            from: self.own.clone(),
        };
        let response = self
            .http
            .post(&url)
            .timeout(Duration::from_secs(RPC_TIMEOUT_SECS))
            .json(&request)
            .send()
            .await
            .map_err(|e| WorkerError::Dht(e.to_string()))?
            .error_for_status()
            .map_err(|e| WorkerError::Dht(e.to_string()))?;
        let body: FindNodeResponse = response
            .json()
            .await
            .map_err(|e| WorkerError::Dht(e.to_string()))?;
        Ok(body.closer)
    }

    async fn rpc_store(&self, peer: &PeerInfo, request: &StoreProviderRequest) -> WorkerResult<()> {
        let url = format!("http://{}/dht/store", peer.address);
        self.http
            .post(&url)
            .timeout(Duration::from_secs(RPC_TIMEOUT_SECS))
            .json(request)
            .send()
            .await
            .map_err(|e| WorkerError::Dht(e.to_string()))?
            .error_for_status()
            .map_err(|e| WorkerError::Dht(e.to_string()))?;
        Ok(())
    }

    async fn rpc_find_providers(
        &self,
        peer: &PeerInfo,
        key_hex: &str,
    ) -> WorkerResult<FindProvidersResponse> {
        let url = format!("http://{}/dht/find-providers", peer.address);
        let request = FindProvidersRequest {
            key: key_hex.to_string(),
            from: self.own.clone(),
        };
        self.http
            .post(&url)
            .timeout(Duration::from_secs(RPC_TIMEOUT_SECS))
            .json(&request)
            .send()
            .await
            .map_err(|e| WorkerError::Dht(e.to_string()))?
            .error_for_status()
            .map_err(|e| WorkerError::Dht(e.to_string()))?
            .json()
            .await
            .map_err(|e| WorkerError::Dht(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_common::types::peer_id_hex;
    use uuid::Uuid;

    fn node_at(port: u16) -> DhtNode {
        DhtNode::new(PeerInfo {
            peer_id: peer_id_hex(&Uuid::new_v4()),
            address: format!("127.0.0.1:{}", port).parse().unwrap(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_new_rejects_invalid_peer_id() {
        let result = DhtNode::new(PeerInfo {
            peer_id: "not-hex".to_string(),
            address: "127.0.0.1:7171".parse().unwrap(),
        });
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_local_store_and_lookup_without_peers() {
        let node = node_at(7171);
        node.announce("note-convert").await;

        let providers = node.find_providers("note-convert").await;
        assert_eq!(providers.len(), 1);
        assert_eq!(providers[0].service, "note-convert");
        assert_eq!(providers[0].peer_id, node.own_peer().peer_id);
    }

    #[tokio::test]
    async fn test_handle_find_node_learns_sender() {
        let node = node_at(7171);
        let sender = PeerInfo {
            peer_id: peer_id_hex(&Uuid::new_v4()),
            address: "127.0.0.1:7272".parse().unwrap(),
        };

        let response = node
            .handle_find_node(FindNodeRequest {
                target: node.own_peer().peer_id.clone(),
                from: sender.clone(),
            })
            .await;

        assert_eq!(node.peer_count().await, 1);
        assert!(response.closer.contains(&sender));
    }

    #[tokio::test]
    async fn test_handle_store_deduplicates_by_peer() {
        let node = node_at(7171);
        let key = NodeId::from_key("doc-ocr").to_hex();
        let provider_id = peer_id_hex(&Uuid::new_v4());

        for port in [7001u16, 7002] {
            node.handle_store(StoreProviderRequest {
                key: key.clone(),
                provider: ProviderRecord {
                    service: "doc-ocr".to_string(),
                    peer_id: provider_id.clone(),
                    address: format!("127.0.0.1:{}", port).parse().unwrap(),
                },
                from: PeerInfo {
                    peer_id: peer_id_hex(&Uuid::new_v4()),
                    address: "127.0.0.1:7999".parse().unwrap(),
                },
            })
            .await;
        }

        let response = node
            .handle_find_providers(FindProvidersRequest {
                key,
                from: PeerInfo {
                    peer_id: peer_id_hex(&Uuid::new_v4()),
                    address: "127.0.0.1:7998".parse().unwrap(),
                },
            })
            .await;

        // 同一ピアの再告知はアドレス更新として扱う
        assert_eq!(response.providers.len(), 1);
        assert_eq!(response.providers[0].address.port(), 7002);
    }
}
