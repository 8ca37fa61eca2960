//! 通信プロトコル定義
//!
//! Worker↔Coordinator間およびワーカーピアAPI間の通信メッセージ

use crate::types::{
    BootstrapRecord, Capabilities, NetworkAddress, ServiceHealth, ServiceType, WorkerStatus,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr};
use uuid::Uuid;

/// ワーカー登録リクエスト
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegisterRequest {
    /// 能力記述子
    pub capabilities: Capabilities,
    /// 到達アドレス（ピアAPIのソケットアドレス）
    pub network_address: NetworkAddress,
}

/// ワーカー登録レスポンス
///
/// `worker_id`が以後の全呼び出しで使う唯一のアイデンティティとなる。
/// エージェントは自己生成IDを直ちに破棄しなければならない。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegisterResponse {
    /// Coordinatorが割り当てたワーカーID
    pub worker_id: Uuid,
    /// 初期割り当てサービス
    pub assigned_services: Vec<String>,
}

/// ハートビートリクエスト
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HeartbeatRequest {
    /// ワーカーID（register応答で受領したもの）
    pub worker_id: Uuid,
    /// ワーカー自身の状態申告（参考情報。分類を上書きしない）
    pub status_hint: WorkerStatus,
    /// 現在の負荷（0.0-100.0）
    pub load: f32,
    /// ローカルサービスのヘルス要約
    #[serde(default)]
    pub local_service_health: BTreeMap<String, ServiceHealth>,
}

/// ハートビートレスポンス
///
/// 最新の割り当てを載せて返すことで、専用のプッシュチャネルなしで
/// ワーカー側の監督タスクが収束する。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HeartbeatResponse {
    /// 現在の割り当てサービス
    pub assigned_services: Vec<String>,
}

/// 登録解除リクエスト（シャットダウン時のベストエフォート）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeregisterRequest {
    /// ワーカーID
    pub worker_id: Uuid,
}

/// サービスギャップレポート（GET /admin/gaps）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GapReport {
    /// 対象サービス種別
    pub service: ServiceType,
    /// 現在の健全レプリカ数
    pub healthy_replicas: u32,
    /// 不足レプリカ数
    pub missing: u32,
}

/// ブートストラップクレームリクエスト
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClaimBootstrapRequest {
    /// クレーム元（ライトハウス候補）のピアAPIアドレス
    pub lighthouse_address: SocketAddr,
}

/// ブートストラップクレームレスポンス
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClaimBootstrapResponse {
    /// このリクエストでレコードを新規作成できたか
    /// falseは既存レコードが返されたことを意味する（正常な参加側経路）
    pub claimed: bool,
    /// クラスターのブートストラップレコード
    pub record: BootstrapRecord,
}

/// ライトハウス有効化リクエスト
///
/// CA秘密鍵は封緘済みのものだけを受け付ける。平文の鍵素材が
/// ストアに書かれることはない。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivateBootstrapRequest {
    /// ライトハウスのピアAPIアドレス（クレーム時と一致すること）
    pub lighthouse_address: SocketAddr,
    /// CA証明書（PEM）
    pub ca_cert_pem: String,
    /// 封緘済みCA秘密鍵（hex: nonce||ciphertext）
    pub ca_key_sealed: String,
    /// ライトハウスのオーバーレイアドレス
    pub lighthouse_overlay_address: Ipv4Addr,
}

/// オーバーレイアドレス割り当てリクエスト
///
/// アドレス割り当てと証明書発行は1トランザクションとして扱い、
/// アドレス衝突を防ぐ。CSRのみを送り、CA鍵素材には触れない。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AllocateRequest {
    /// 証明書署名要求（PEM）
    pub csr_pem: String,
}

/// オーバーレイアドレス割り当てレスポンス
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AllocateResponse {
    /// 割り当てられたオーバーレイアドレス
    pub address: Ipv4Addr,
    /// ライトハウスが署名した証明書（PEM）
    pub certificate_pem: String,
    /// CA証明書（PEM）
    pub ca_cert_pem: String,
}

/// 証明書署名リクエスト（ライトハウスのピアAPI向け）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SignRequest {
    /// 証明書署名要求（PEM）
    pub csr_pem: String,
    /// 発行対象のオーバーレイアドレス
    pub overlay_address: Ipv4Addr,
}

/// 証明書署名レスポンス
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SignResponse {
    /// 署名済み証明書（PEM）
    pub certificate_pem: String,
}

/// エントリーポイント登録リクエスト
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntryPointRequest {
    /// ワーカーID
    pub worker_id: Uuid,
    /// パブリック到達可能アドレス
    pub address: SocketAddr,
}

/// DHTピア情報
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerInfo {
    /// ピアID（SHA-256、hex表現）
    pub peer_id: String,
    /// ピアAPIアドレス
    pub address: SocketAddr,
}

/// DHTシードレスポンス（GET /dht/seeds）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DhtSeedsResponse {
    /// 現在健全なワーカーのピア情報
    pub seeds: Vec<PeerInfo>,
}

/// DHT find-nodeリクエスト
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FindNodeRequest {
    /// 検索対象ID（hex）
    pub target: String,
    /// 送信元ピア（受信側のピアテーブルに追加される）
    pub from: PeerInfo,
}

/// DHT find-nodeレスポンス
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FindNodeResponse {
    /// 対象により近い既知ピア
    pub closer: Vec<PeerInfo>,
}

/// サービス提供者レコード
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderRecord {
    /// サービス名
    pub service: String,
    /// 提供者のピアID（hex）
    pub peer_id: String,
    /// 提供者のピアAPIアドレス
    pub address: SocketAddr,
}

/// DHT提供者レコード保存リクエスト
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoreProviderRequest {
    /// キー（sha256(サービス名)、hex）
    pub key: String,
    /// 提供者レコード
    pub provider: ProviderRecord,
    /// 送信元ピア
    pub from: PeerInfo,
}

/// DHT提供者検索リクエスト
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FindProvidersRequest {
    /// キー（sha256(サービス名)、hex）
    pub key: String,
    /// 送信元ピア
    pub from: PeerInfo,
}

/// DHT提供者検索レスポンス
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FindProvidersResponse {
    /// 既知の提供者レコード
    pub providers: Vec<ProviderRecord>,
    /// キーにより近い既知ピア
    pub closer: Vec<PeerInfo>,
}
