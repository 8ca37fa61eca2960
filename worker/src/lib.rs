//! Fleet Worker Agent
//!
//! 起動時に自ノードの能力をプローブし、オーバーレイ参加・Coordinator
//! 登録を経て、割り当てられたサービスをローカルプロセスとして稼働
//! させるエージェント

#![warn(missing_docs)]

/// エージェントライフサイクル
pub mod agent;

/// ピアAPI
pub mod api;

/// Coordinatorクライアント
pub mod client;

/// Kademlia風DHT
pub mod dht;

/// ロギング初期化
pub mod logging;

/// オーバーレイ参加・証明書
pub mod overlay;

/// 能力プローブ
pub mod probe;

/// サービススーパーバイザー
pub mod supervisor;
