//! 共通型定義
//!
//! Capabilities, Worker, ServiceType, BootstrapRecord等のコアデータ型

use crate::error::{CommonError, CommonResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::net::{Ipv4Addr, SocketAddr};
use uuid::Uuid;

/// ノードの能力記述子
///
/// 起動時のプローブで一度だけ生成され、ノードの生存期間中は不変。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Capabilities {
    /// CPUコア数
    pub cpu_cores: u32,
    /// メモリ総容量（バイト）
    pub ram_bytes: u64,
    /// GPU搭載フラグ
    pub gpu_present: bool,
    /// GPU VRAM容量（バイト）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_vram_bytes: Option<u64>,
    /// ディスク総容量（バイト）
    pub disk_bytes: u64,
    /// パブリック到達可能フラグ
    pub publicly_reachable: bool,
}

impl Capabilities {
    /// 登録時のバリデーション
    pub fn validate(&self) -> CommonResult<()> {
        if self.cpu_cores == 0 {
            return Err(CommonError::Validation("cpu_cores must be non-zero".to_string()));
        }
        if self.ram_bytes == 0 {
            return Err(CommonError::Validation("ram_bytes must be non-zero".to_string()));
        }
        if !self.gpu_present && self.gpu_vram_bytes.is_some() {
            return Err(CommonError::Validation(
                "gpu_vram_bytes requires gpu_present".to_string(),
            ));
        }
        Ok(())
    }
}

/// ワーカーへの到達アドレス
///
/// オーバーレイ（VPN）アドレスを優先し、参加できなかった場合は
/// リレーアドレスにフォールバックする。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "addr", rename_all = "lowercase")]
pub enum NetworkAddress {
    /// オーバーレイネットワーク上のアドレス
    Overlay(SocketAddr),
    /// リレー（トンネル）経由のアドレス
    Relay(SocketAddr),
}

impl NetworkAddress {
    /// 実際に接続に使用するソケットアドレス
    pub fn socket_addr(&self) -> SocketAddr {
        match self {
            NetworkAddress::Overlay(addr) | NetworkAddress::Relay(addr) => *addr,
        }
    }

    /// オーバーレイアドレスかどうか
    pub fn is_overlay(&self) -> bool {
        matches!(self, NetworkAddress::Overlay(_))
    }
}

impl std::fmt::Display for NetworkAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NetworkAddress::Overlay(addr) => write!(f, "overlay://{}", addr),
            NetworkAddress::Relay(addr) => write!(f, "relay://{}", addr),
        }
    }
}

/// ワーカー状態
///
/// 最終ハートビートからの経過時間のみで決まる。
/// ワーカー自身の申告で上書きされることはない。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    /// 正常
    Healthy,
    /// 劣化（ハートビート遅延）
    Degraded,
    /// 到達不能
    ///
    /// 時刻ベースの分類はこの状態を生成しない（`t_dead`超過は状態遷移
    /// ではなくレコード削除になる）。ワーカー側の自己申告ヒントとして
    /// のみワイヤに現れる。
    Unreachable,
}

/// ローカルサービスのヘルス状態
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ServiceHealth {
    /// 起動中（猶予期間内）
    Starting,
    /// 稼働中
    Running,
    /// 異常
    Unhealthy,
}

/// ワーカーレコード
///
/// Coordinatorのみが所有する。`id`は登録時にCoordinatorが割り当て、
/// クライアントが選ぶことはできない。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Worker {
    /// 一意識別子（Coordinator割り当て）
    pub id: Uuid,
    /// 能力記述子（不変）
    pub capabilities: Capabilities,
    /// 到達アドレス
    pub network_address: NetworkAddress,
    /// 割り当て済みサービス種別名
    #[serde(default)]
    pub assigned_services: BTreeSet<String>,
    /// ワーカー状態
    pub status: WorkerStatus,
    /// 登録日時
    pub registered_at: DateTime<Utc>,
    /// 最終ハートビート時刻
    pub last_heartbeat: DateTime<Utc>,
    /// 現在の負荷（0.0-100.0）
    pub current_load: f32,
    /// ローカルサービスのヘルス（ハートビートで更新）
    #[serde(default)]
    pub service_health: BTreeMap<String, ServiceHealth>,
}

impl Worker {
    /// サービス種別に対する能力要件を満たすか
    pub fn satisfies(&self, service: &ServiceType) -> bool {
        !service.requires_gpu || self.capabilities.gpu_present
    }
}

/// サービス種別（静的カタログのエントリ）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceType {
    /// サービス名（例: "doc-ocr"）
    pub name: String,
    /// GPU必須フラグ
    pub requires_gpu: bool,
    /// 目標レプリカ数
    pub desired_replicas: u32,
    /// ワーカー上でサービスが待ち受けるローカルポート
    pub port: u16,
}

/// 既定のサービスカタログ
///
/// ワーカーがホストするバックエンドサービスの固定カタログ。
/// サービス本体は不透明なローカルプロセスとして起動・プロキシされる。
pub fn default_catalog() -> Vec<ServiceType> {
    vec![
        ServiceType {
            name: "doc-ocr".to_string(),
            requires_gpu: true,
            desired_replicas: 2,
            port: 17021,
        },
        ServiceType {
            name: "rag-query".to_string(),
            requires_gpu: true,
            desired_replicas: 2,
            port: 17022,
        },
        ServiceType {
            name: "note-convert".to_string(),
            requires_gpu: false,
            desired_replicas: 2,
            port: 17023,
        },
        ServiceType {
            name: "entity-graph".to_string(),
            requires_gpu: false,
            desired_replicas: 1,
            port: 17024,
        },
    ]
}

/// ブートストラップレコードの状態
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BootstrapStatus {
    /// クレーム済み・ライトハウス初期化中
    Pending,
    /// ライトハウス稼働中
    Active,
}

/// オーバーレイネットワークのブートストラップレコード
///
/// クラスターごとに1件のみ。作成はアトミックな「不在時のみ作成」で行い、
/// 同時起動した複数ノードが両方ライトハウスになることを防ぐ。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BootstrapRecord {
    /// CA証明書（PEM）。ライトハウスがActive化するまでNone
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_cert_pem: Option<String>,
    /// AES-256-GCMで封緘されたCA秘密鍵（hex: nonce||ciphertext）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_key_sealed: Option<String>,
    /// ライトハウスの実アドレス（ピアAPI）
    pub lighthouse_address: SocketAddr,
    /// ライトハウスのオーバーレイアドレス
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lighthouse_overlay_address: Option<Ipv4Addr>,
    /// ネットワークプレフィックス（例: "10.42.0.0/16"）
    pub network_prefix: String,
    /// 次に割り当てるホストオフセット（単調増加・再利用なし）
    pub next_allocatable_ip: u32,
    /// 作成日時
    pub created_at: DateTime<Utc>,
    /// レコード状態
    pub status: BootstrapStatus,
}

/// ライトハウス自身が使用するホストオフセット
pub const LIGHTHOUSE_HOST_OFFSET: u32 = 1;

impl BootstrapRecord {
    /// 新規Pendingレコードを作成
    pub fn pending(lighthouse_address: SocketAddr, network_prefix: String) -> Self {
        Self {
            ca_cert_pem: None,
            ca_key_sealed: None,
            lighthouse_address,
            lighthouse_overlay_address: None,
            network_prefix,
            // 1番地はライトハウス用に予約
            next_allocatable_ip: LIGHTHOUSE_HOST_OFFSET + 1,
            created_at: Utc::now(),
            status: BootstrapStatus::Pending,
        }
    }

    /// プレフィックス内のn番目のホストアドレスを計算
    pub fn overlay_ip(&self, host_offset: u32) -> CommonResult<Ipv4Addr> {
        let base = self
            .network_prefix
            .split('/')
            .next()
            .unwrap_or_default()
            .parse::<Ipv4Addr>()
            .map_err(|_| {
                CommonError::Validation(format!("invalid network prefix: {}", self.network_prefix))
            })?;
        let prefix_len: u32 = self
            .network_prefix
            .split('/')
            .nth(1)
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| {
                CommonError::Validation(format!("invalid network prefix: {}", self.network_prefix))
            })?;
        let host_bits = 32 - prefix_len;
        if host_bits < 32 && host_offset >= (1u32 << host_bits) {
            return Err(CommonError::Validation(format!(
                "overlay address space exhausted at offset {}",
                host_offset
            )));
        }
        Ok(Ipv4Addr::from(u32::from(base) + host_offset))
    }
}

/// エントリーポイント
///
/// パブリック到達可能なワーカーのアドレス。NAT配下の後続参加ノードが
/// ランデブーに使用する。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EntryPoint {
    /// ワーカーID
    pub worker_id: Uuid,
    /// 到達可能アドレス
    pub address: SocketAddr,
    /// 登録日時
    pub registered_at: DateTime<Utc>,
}

/// ワーカーIDからDHTピアIDを導出（SHA-256、hex表現）
///
/// Coordinatorのシード応答とワーカー側DHTノードの双方で同じ導出を使う。
pub fn peer_id_hex(worker_id: &Uuid) -> String {
    let digest = Sha256::digest(worker_id.as_bytes());
    hex::encode(digest)
}
