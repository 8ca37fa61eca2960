//! Worker Agentライフサイクル
//!
//! プローブ → オーバーレイ参加 → 登録 → 稼働（ハートビート・割り当て
//! 追従・DHT参加） → シャットダウンの一連を駆動する。
//!
//! ハートビート・サービス監督・DHT維持は独立したタスクとして動き、
//! 割り当ての伝播にはwatchチャネルを使う。

use crate::{
    api::{self, PeerApiState},
    client::CoordinatorClient,
    dht::DhtNode,
    overlay::{self, OverlayRole},
    probe::{self, LoadSampler},
    supervisor::ServiceSupervisor,
};
use fleet_common::{
    config::WorkerConfig,
    error::{WorkerError, WorkerResult},
    protocol::{HeartbeatRequest, PeerInfo},
    types::{
        default_catalog, peer_id_hex, Capabilities, NetworkAddress, ServiceHealth, WorkerStatus,
    },
};
use std::collections::BTreeSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tracing::{error, info, warn};
use uuid::Uuid;

/// 再試行バックオフの上限（秒）
const MAX_BACKOFF_SECS: u64 = 60;

/// 指数バックオフ（1, 2, 4, ... 最大60秒）
pub fn backoff(attempt: u32) -> Duration {
    let secs = 1u64 << attempt.min(6);
    Duration::from_secs(secs.min(MAX_BACKOFF_SECS))
}

/// ローカルIPアドレスを取得
///
/// ダミーのUDP接続でルーティング上の送信元アドレスを調べる。
fn local_ip() -> Option<IpAddr> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    Some(socket.local_addr().ok()?.ip())
}

/// このノードが外部へ公示するピアAPIアドレスを決める
///
/// `FLEET_ADVERTISE_ADDR`が設定されていればそれを使う。未設定なら
/// ローカルIPを自動検出し、検出できない場合のみループバックに落ちる。
fn advertise_address(config: &WorkerConfig) -> WorkerResult<SocketAddr> {
    if let Ok(value) = std::env::var("FLEET_ADVERTISE_ADDR") {
        return value
            .parse()
            .map_err(|_| WorkerError::Internal(format!("invalid FLEET_ADVERTISE_ADDR: {}", value)));
    }
    let ip = local_ip().unwrap_or_else(|| IpAddr::from([127, 0, 0, 1]));
    Ok(SocketAddr::new(ip, config.peer_api_port))
}

/// Worker Agent
pub struct Agent {
    config: WorkerConfig,
    client: CoordinatorClient,
    capabilities: Capabilities,
    supervisor: ServiceSupervisor,
}

impl Agent {
    /// 能力をプローブしてエージェントを構築する
    pub fn bootstrap(config: WorkerConfig) -> WorkerResult<Self> {
        let capabilities = probe::probe(config.publicly_reachable)?;
        info!(
            "Probed capabilities: {} cores, {} MiB RAM, gpu={}",
            capabilities.cpu_cores,
            capabilities.ram_bytes / (1024 * 1024),
            capabilities.gpu_present
        );

        let client = CoordinatorClient::new(&config);
        let supervisor = ServiceSupervisor::new(Arc::new(default_catalog()), config.service_grace_secs);

        Ok(Self {
            config,
            client,
            capabilities,
            supervisor,
        })
    }

    /// エージェントを稼働させる（Ctrl-Cで戻る）
    pub async fn run(self) -> WorkerResult<()> {
        let peer_address = advertise_address(&self.config)?;

        // オーバーレイ参加。失敗してもリレーモードで続行する
        let role = overlay::establish(&self.client, &self.config, peer_address).await?;
        let (network_address, signer) = match role {
            OverlayRole::Lighthouse { identity, signer } => {
                info!("Overlay identity established as lighthouse: {}", identity.address);
                (
                    NetworkAddress::Overlay(SocketAddr::from((
                        identity.address,
                        self.config.peer_api_port,
                    ))),
                    Some(Arc::new(signer)),
                )
            }
            OverlayRole::Member { identity } => {
                info!("Overlay identity established: {}", identity.address);
                (
                    NetworkAddress::Overlay(SocketAddr::from((
                        identity.address,
                        self.config.peer_api_port,
                    ))),
                    None,
                )
            }
            OverlayRole::Relay => {
                info!("Operating in relay mode at {}", peer_address);
                (NetworkAddress::Relay(peer_address), None)
            }
        };

        // 登録。成功するまでバックオフつきで再試行する
        let registration = self.register_with_retry(network_address).await;
        let worker_id = Arc::new(RwLock::new(registration.0));
        let initial_services: BTreeSet<String> = registration.1.into_iter().collect();
        info!("Registered as worker {}", *worker_id.read().await);

        let (assignment_tx, assignment_rx) = watch::channel(initial_services);

        if self.capabilities.publicly_reachable {
            let id = *worker_id.read().await;
            if let Err(err) = self.client.append_entrypoint(id, peer_address).await {
                warn!("Failed to publish entrypoint: {}", err);
            }
        }

        let dht = DhtNode::new(PeerInfo {
            peer_id: peer_id_hex(&*worker_id.read().await),
            address: network_address.socket_addr(),
        })?;

        // ピアAPI起動
        let api_state = PeerApiState {
            dht: dht.clone(),
            signer,
            supervisor: self.supervisor.clone(),
            http: reqwest::Client::new(),
        };
        let listener =
            tokio::net::TcpListener::bind(("0.0.0.0", self.config.peer_api_port))
                .await
                .map_err(|e| WorkerError::Internal(format!("failed to bind peer API: {}", e)))?;
        info!("Peer API listening on port {}", self.config.peer_api_port);
        tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, api::create_router(api_state)).await {
                error!("Peer API server error: {}", err);
            }
        });

        // 独立タスク群
        let heartbeat_handle = tokio::spawn(heartbeat_loop(
            self.client.clone(),
            self.config.clone(),
            self.capabilities.clone(),
            network_address,
            worker_id.clone(),
            self.supervisor.clone(),
            assignment_tx,
            peer_address,
        ));
        let reconcile_handle = tokio::spawn(reconcile_loop(
            self.supervisor.clone(),
            assignment_rx.clone(),
        ));
        let dht_handle = tokio::spawn(dht_loop(
            dht,
            self.client.clone(),
            self.config.dht_refresh_interval_secs,
            assignment_rx,
        ));

        tokio::signal::ctrl_c()
            .await
            .map_err(|e| WorkerError::Internal(format!("signal handler failed: {}", e)))?;
        info!("Shutdown requested");

        heartbeat_handle.abort();
        reconcile_handle.abort();
        dht_handle.abort();

        // ベストエフォートの登録解除とサービス停止
        let id = *worker_id.read().await;
        if let Err(err) = self.client.deregister(id).await {
            warn!("Deregistration failed (coordinator will evict by timeout): {}", err);
        }
        self.supervisor.shutdown().await;

        Ok(())
    }

    async fn register_with_retry(&self, network_address: NetworkAddress) -> (Uuid, Vec<String>) {
        let mut attempt = 0u32;
        loop {
            match self
                .client
                .register(self.capabilities.clone(), network_address)
                .await
            {
                Ok(response) => return (response.worker_id, response.assigned_services),
                Err(err) => {
                    warn!("Registration failed (attempt {}): {}", attempt + 1, err);
                    tokio::time::sleep(backoff(attempt)).await;
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }
}

/// ハートビートタスク
///
/// 応答に載る割り当てをwatchチャネルへ流す。404を受けたら古い
/// アイデンティティを破棄して再登録する。
async fn heartbeat_loop(
    client: CoordinatorClient,
    config: WorkerConfig,
    capabilities: Capabilities,
    network_address: NetworkAddress,
    worker_id: Arc<RwLock<Uuid>>,
    supervisor: ServiceSupervisor,
    assignment_tx: watch::Sender<BTreeSet<String>>,
    peer_address: SocketAddr,
) {
    let mut sampler = LoadSampler::new();
    let mut interval = tokio::time::interval(Duration::from_secs(config.heartbeat_interval_secs));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        interval.tick().await;

        let local_service_health = supervisor.health_snapshot().await;
        let status_hint = if local_service_health
            .values()
            .any(|h| *h == ServiceHealth::Unhealthy)
        {
            WorkerStatus::Degraded
        } else {
            WorkerStatus::Healthy
        };

        let request = HeartbeatRequest {
            worker_id: *worker_id.read().await,
            status_hint,
            load: sampler.current_load(),
            local_service_health,
        };

        match client.heartbeat(&request).await {
            Ok(response) => {
                let services: BTreeSet<String> = response.assigned_services.into_iter().collect();
                assignment_tx.send_if_modified(|current| {
                    if *current == services {
                        false
                    } else {
                        *current = services;
                        true
                    }
                });
            }
            Err(WorkerError::HeartbeatRejected) => {
                warn!("Coordinator no longer knows this worker, re-registering");
                let mut attempt = 0u32;
                loop {
                    match client.register(capabilities.clone(), network_address).await {
                        Ok(response) => {
                            info!("Re-registered as worker {}", response.worker_id);
                            *worker_id.write().await = response.worker_id;
                            if capabilities.publicly_reachable {
                                // 旧IDで公示したエントリーポイントを新IDで出し直す
                                if let Err(err) = client
                                    .append_entrypoint(response.worker_id, peer_address)
                                    .await
                                {
                                    warn!("Failed to republish entrypoint: {}", err);
                                }
                            }
                            let services: BTreeSet<String> =
                                response.assigned_services.into_iter().collect();
                            let _ = assignment_tx.send(services);
                            break;
                        }
                        Err(err) => {
                            warn!("Re-registration failed (attempt {}): {}", attempt + 1, err);
                            tokio::time::sleep(backoff(attempt)).await;
                            attempt = attempt.saturating_add(1);
                        }
                    }
                }
            }
            Err(err) => {
                warn!("Heartbeat failed: {}", err);
            }
        }
    }
}

/// サービス監督タスク
///
/// 割り当て変更に追従し、終了したプロセスを定期的に再起動する。
async fn reconcile_loop(
    supervisor: ServiceSupervisor,
    mut assignment_rx: watch::Receiver<BTreeSet<String>>,
) {
    let assigned = assignment_rx.borrow().clone();
    supervisor.reconcile(&assigned).await;

    let mut restart_interval = tokio::time::interval(Duration::from_secs(10));
    restart_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            changed = assignment_rx.changed() => {
                if changed.is_err() {
                    return;
                }
                let assigned = assignment_rx.borrow_and_update().clone();
                info!("Assignment changed: {:?}", assigned);
                supervisor.reconcile(&assigned).await;
            }
            _ = restart_interval.tick() => {
                supervisor.restart_exited().await;
            }
        }
    }
}

/// DHT維持タスク
///
/// シード取得とテーブルリフレッシュ、割り当てサービスの提供告知を
/// 定期的に行う。Coordinator不在時でも既存ピア経由で検索が続く。
async fn dht_loop(
    dht: DhtNode,
    client: CoordinatorClient,
    refresh_interval_secs: u64,
    assignment_rx: watch::Receiver<BTreeSet<String>>,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(refresh_interval_secs));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        interval.tick().await;

        match client.dht_seeds().await {
            Ok(seeds) => dht.bootstrap(seeds).await,
            Err(err) => {
                // Coordinator不在。既存のピアテーブルで運用を続ける
                warn!("DHT seed fetch failed, relying on known peers: {}", err);
                let own_id = crate::dht::NodeId::from_hex(&dht.own_peer().peer_id);
                if let Some(id) = own_id {
                    dht.iterative_find_node(id).await;
                }
            }
        }

        let assigned = assignment_rx.borrow().clone();
        for service in assigned {
            dht.announce(&service).await;
        }
    }
}
