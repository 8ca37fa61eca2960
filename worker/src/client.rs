//! Coordinatorクライアント
//!
//! Worker AgentからCoordinator REST APIへの通信を担う。
//! 各呼び出しに個別のタイムアウトを適用する。

use fleet_common::{
    config::WorkerConfig,
    error::{WorkerError, WorkerResult},
    protocol::{
        ActivateBootstrapRequest, AllocateRequest, AllocateResponse, ClaimBootstrapRequest,
        ClaimBootstrapResponse, DeregisterRequest, DhtSeedsResponse, EntryPointRequest,
        HeartbeatRequest, HeartbeatResponse, PeerInfo, RegisterRequest, RegisterResponse,
    },
    types::{Capabilities, NetworkAddress},
};
use reqwest::StatusCode;
use std::net::SocketAddr;
use std::time::Duration;
use uuid::Uuid;

/// Coordinator APIクライアント
#[derive(Clone)]
pub struct CoordinatorClient {
    base_url: String,
    http: reqwest::Client,
    timeout: Duration,
}

impl CoordinatorClient {
    /// 設定からクライアントを作成
    pub fn new(config: &WorkerConfig) -> Self {
        Self {
            base_url: config.coordinator_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
            timeout: Duration::from_secs(config.request_timeout_secs),
        }
    }

    /// ワーカーを登録する
    ///
    /// 応答の`worker_id`が以後の唯一のアイデンティティ。呼び出し側は
    /// ローカルで生成した仮IDを直ちに破棄すること。
    pub async fn register(
        &self,
        capabilities: Capabilities,
        network_address: NetworkAddress,
    ) -> WorkerResult<RegisterResponse> {
        let url = format!("{}/worker/register", self.base_url);
        let request = RegisterRequest {
            capabilities,
            network_address,
        };

        let response = self
            .http
            .post(&url)
            .timeout(self.timeout)
            .json(&request)
            .send()
            .await
            .map_err(|e| WorkerError::Registration(e.to_string()))?;

        if !response.status().is_success() {
            return Err(WorkerError::Registration(format!(
                "coordinator returned {}",
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| WorkerError::Registration(e.to_string()))
    }

    /// ハートビートを送信する
    ///
    /// Coordinatorが404を返した場合は`HeartbeatRejected`。呼び出し側は
    /// 再登録して新しいIDを得なければならない。
    pub async fn heartbeat(&self, request: &HeartbeatRequest) -> WorkerResult<HeartbeatResponse> {
        let url = format!("{}/worker/heartbeat", self.base_url);

        let response = self
            .http
            .post(&url)
            .timeout(self.timeout)
            .json(request)
            .send()
            .await
            .map_err(|e| WorkerError::Heartbeat(e.to_string()))?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(WorkerError::HeartbeatRejected),
            status if status.is_success() => response
                .json()
                .await
                .map_err(|e| WorkerError::Heartbeat(e.to_string())),
            status => Err(WorkerError::Heartbeat(format!(
                "coordinator returned {}",
                status
            ))),
        }
    }

    /// 登録解除（シャットダウン時のベストエフォート）
    pub async fn deregister(&self, worker_id: Uuid) -> WorkerResult<()> {
        let url = format!("{}/worker/deregister", self.base_url);
        self.http
            .post(&url)
            .timeout(self.timeout)
            .json(&DeregisterRequest { worker_id })
            .send()
            .await
            .map_err(|e| WorkerError::Registration(e.to_string()))?;
        Ok(())
    }

    /// ブートストラップレコードをクレームする
    pub async fn claim_bootstrap(
        &self,
        lighthouse_address: SocketAddr,
    ) -> WorkerResult<ClaimBootstrapResponse> {
        let url = format!("{}/overlay/claim-bootstrap", self.base_url);
        let response = self
            .http
            .post(&url)
            .timeout(self.timeout)
            .json(&ClaimBootstrapRequest { lighthouse_address })
            .send()
            .await
            .map_err(|e| WorkerError::Overlay(e.to_string()))?
            .error_for_status()
            .map_err(|e| WorkerError::Overlay(e.to_string()))?;

        response
            .json()
            .await
            .map_err(|e| WorkerError::Overlay(e.to_string()))
    }

    /// ライトハウスを有効化する
    pub async fn activate_bootstrap(
        &self,
        request: &ActivateBootstrapRequest,
    ) -> WorkerResult<()> {
        let url = format!("{}/overlay/activate", self.base_url);
        self.http
            .post(&url)
            .timeout(self.timeout)
            .json(request)
            .send()
            .await
            .map_err(|e| WorkerError::Overlay(e.to_string()))?
            .error_for_status()
            .map_err(|e| WorkerError::Overlay(e.to_string()))?;
        Ok(())
    }

    /// オーバーレイアドレスの割り当てと証明書発行を受ける
    pub async fn allocate(&self, csr_pem: String) -> WorkerResult<AllocateResponse> {
        let url = format!("{}/overlay/allocate", self.base_url);
        let response = self
            .http
            .post(&url)
            .timeout(self.timeout)
            .json(&AllocateRequest { csr_pem })
            .send()
            .await
            .map_err(|e| WorkerError::CertificateIssuance(e.to_string()))?;

        if !response.status().is_success() {
            return Err(WorkerError::CertificateIssuance(format!(
                "coordinator returned {}",
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| WorkerError::CertificateIssuance(e.to_string()))
    }

    /// パブリック到達可能アドレスをエントリーポイントとして公示する
    pub async fn append_entrypoint(
        &self,
        worker_id: Uuid,
        address: SocketAddr,
    ) -> WorkerResult<()> {
        let url = format!("{}/overlay/entrypoints", self.base_url);
        self.http
            .post(&url)
            .timeout(self.timeout)
            .json(&EntryPointRequest { worker_id, address })
            .send()
            .await
            .map_err(|e| WorkerError::Overlay(e.to_string()))?
            .error_for_status()
            .map_err(|e| WorkerError::Overlay(e.to_string()))?;
        Ok(())
    }

    /// DHTブートストラップシードを取得する
    pub async fn dht_seeds(&self) -> WorkerResult<Vec<PeerInfo>> {
        let url = format!("{}/dht/seeds", self.base_url);
        let response: DhtSeedsResponse = self
            .http
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| WorkerError::Dht(e.to_string()))?
            .error_for_status()
            .map_err(|e| WorkerError::Dht(e.to_string()))?
            .json()
            .await
            .map_err(|e| WorkerError::Dht(e.to_string()))?;
        Ok(response.seeds)
    }
}
