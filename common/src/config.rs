//! 設定管理
//!
//! CoordinatorConfig, WorkerConfig等の設定構造体

use serde::{Deserialize, Serialize};

/// Coordinator設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// ホストアドレス (デフォルト: "0.0.0.0")
    #[serde(default = "default_host")]
    pub host: String,

    /// ポート番号 (デフォルト: 7070)
    #[serde(default = "default_port")]
    pub port: u16,

    /// healthyと判定する最大ハートビート経過秒数 (デフォルト: 120)
    /// サービスのプロビジョニング（モデルロード等）自体に数分かかるため、
    /// 秒単位ではなく分単位のデフォルトにしている
    #[serde(default = "default_t_healthy")]
    pub t_healthy_secs: u64,

    /// レコードを削除する最大ハートビート経過秒数 (デフォルト: 600)
    #[serde(default = "default_t_dead")]
    pub t_dead_secs: u64,

    /// 再分類・再割り当ての実行間隔（秒） (デフォルト: 30)
    #[serde(default = "default_rebalance_interval")]
    pub rebalance_interval_secs: u64,

    /// ワーカー1台あたりの同時割り当て上限 (デフォルト: 3)
    #[serde(default = "default_max_services")]
    pub max_services_per_worker: usize,

    /// プロキシ転送のタイムアウト（秒） (デフォルト: 20)
    #[serde(default = "default_proxy_timeout")]
    pub proxy_timeout_secs: u64,

    /// オーバーレイネットワークのプレフィックス (デフォルト: "10.42.0.0/16")
    #[serde(default = "default_network_prefix")]
    pub network_prefix: String,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    7070
}

fn default_t_healthy() -> u64 {
    120
}

fn default_t_dead() -> u64 {
    600
}

fn default_rebalance_interval() -> u64 {
    30
}

fn default_max_services() -> usize {
    3
}

fn default_proxy_timeout() -> u64 {
    20
}

fn default_network_prefix() -> String {
    "10.42.0.0/16".to_string()
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            t_healthy_secs: default_t_healthy(),
            t_dead_secs: default_t_dead(),
            rebalance_interval_secs: default_rebalance_interval(),
            max_services_per_worker: default_max_services(),
            proxy_timeout_secs: default_proxy_timeout(),
            network_prefix: default_network_prefix(),
        }
    }
}

impl CoordinatorConfig {
    /// 環境変数で上書きした設定を返す
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(host) = std::env::var("FLEET_COORDINATOR_HOST") {
            config.host = host;
        }
        if let Some(port) = env_parse("FLEET_COORDINATOR_PORT") {
            config.port = port;
        }
        if let Some(secs) = env_parse("FLEET_T_HEALTHY_SECS") {
            config.t_healthy_secs = secs;
        }
        if let Some(secs) = env_parse("FLEET_T_DEAD_SECS") {
            config.t_dead_secs = secs;
        }
        if let Some(secs) = env_parse("FLEET_REBALANCE_INTERVAL_SECS") {
            config.rebalance_interval_secs = secs;
        }
        if let Some(max) = env_parse("FLEET_MAX_SERVICES_PER_WORKER") {
            config.max_services_per_worker = max;
        }
        if let Some(secs) = env_parse("FLEET_PROXY_TIMEOUT_SECS") {
            config.proxy_timeout_secs = secs;
        }
        if let Ok(prefix) = std::env::var("FLEET_NETWORK_PREFIX") {
            config.network_prefix = prefix;
        }
        config
    }
}

/// Worker設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// CoordinatorのURL (デフォルト: "http://localhost:7070")
    #[serde(default = "default_coordinator_url")]
    pub coordinator_url: String,

    /// ピアAPIのバインドポート (デフォルト: 7171)
    #[serde(default = "default_peer_api_port")]
    pub peer_api_port: u16,

    /// ハートビート送信間隔（秒） (デフォルト: 20、t_healthyより短いこと)
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// DHTピアテーブルのリフレッシュ間隔（秒） (デフォルト: 60)
    #[serde(default = "default_dht_refresh_interval")]
    pub dht_refresh_interval_secs: u64,

    /// サービス停止時の猶予期間（秒） (デフォルト: 5)
    #[serde(default = "default_service_grace")]
    pub service_grace_secs: u64,

    /// アウトバウンド呼び出しのタイムアウト（秒） (デフォルト: 10)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// パブリック到達可能として申告するか (デフォルト: false)
    #[serde(default)]
    pub publicly_reachable: bool,

    /// クラスター共有鍵のパスフレーズ
    /// 鍵素材の封緘・開封に使う。全ノードで一致している必要がある
    #[serde(default = "default_cluster_secret")]
    pub cluster_secret: String,
}

fn default_coordinator_url() -> String {
    "http://localhost:7070".to_string()
}

fn default_peer_api_port() -> u16 {
    7171
}

fn default_heartbeat_interval() -> u64 {
    20
}

fn default_dht_refresh_interval() -> u64 {
    60
}

fn default_service_grace() -> u64 {
    5
}

fn default_request_timeout() -> u64 {
    10
}

fn default_cluster_secret() -> String {
    "fleet-dev-secret".to_string()
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            coordinator_url: default_coordinator_url(),
            peer_api_port: default_peer_api_port(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            dht_refresh_interval_secs: default_dht_refresh_interval(),
            service_grace_secs: default_service_grace(),
            request_timeout_secs: default_request_timeout(),
            publicly_reachable: false,
            cluster_secret: default_cluster_secret(),
        }
    }
}

impl WorkerConfig {
    /// 環境変数で上書きした設定を返す
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(url) = std::env::var("FLEET_COORDINATOR_URL") {
            config.coordinator_url = url;
        }
        if let Some(port) = env_parse("FLEET_PEER_API_PORT") {
            config.peer_api_port = port;
        }
        if let Some(secs) = env_parse("FLEET_HEARTBEAT_INTERVAL_SECS") {
            config.heartbeat_interval_secs = secs;
        }
        if let Some(secs) = env_parse("FLEET_DHT_REFRESH_INTERVAL_SECS") {
            config.dht_refresh_interval_secs = secs;
        }
        if let Some(secs) = env_parse("FLEET_SERVICE_GRACE_SECS") {
            config.service_grace_secs = secs;
        }
        if let Some(secs) = env_parse("FLEET_REQUEST_TIMEOUT_SECS") {
            config.request_timeout_secs = secs;
        }
        if let Ok(value) = std::env::var("FLEET_PUBLICLY_REACHABLE") {
            config.publicly_reachable = value == "1" || value.eq_ignore_ascii_case("true");
        }
        if let Ok(secret) = std::env::var("FLEET_CLUSTER_SECRET") {
            config.cluster_secret = secret;
        }
        config
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}
