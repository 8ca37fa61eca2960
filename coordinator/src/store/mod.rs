//! 共有KVストア
//!
//! BootstrapRecordとEntryPointSetをJSONファイルに永続化する。
//! クレーム・有効化・IPアロケーションはすべて単一ロック配下の
//! read-modify-writeで行い、応答前に永続化する（CAS規律）。

use chrono::Utc;
use fleet_common::{
    error::{CoordinatorError, CoordinatorResult},
    protocol::ActivateBootstrapRequest,
    types::{BootstrapRecord, BootstrapStatus, EntryPoint},
};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

/// 永続化される状態
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreState {
    #[serde(default)]
    bootstrap: Option<BootstrapRecord>,
    #[serde(default)]
    entrypoints: Vec<EntryPoint>,
}

/// クラスターストア
#[derive(Clone)]
pub struct ClusterStore {
    path: PathBuf,
    state: Arc<Mutex<StoreState>>,
}

/// データファイルのパスを取得
fn data_file_path() -> CoordinatorResult<PathBuf> {
    // テスト用に環境変数でデータディレクトリを指定可能にする
    let data_dir = if let Ok(dir) = std::env::var("FLEET_COORDINATOR_DATA_DIR") {
        PathBuf::from(dir)
    } else {
        dirs::home_dir()
            .map(|home| home.join(".fleet-coordinator"))
            .ok_or_else(|| CoordinatorError::Store("Failed to resolve home directory".to_string()))?
    };

    Ok(data_dir.join("cluster.json"))
}

impl ClusterStore {
    /// 既定のデータディレクトリでストアを開く
    pub async fn open() -> CoordinatorResult<Self> {
        Self::open_at(data_file_path()?).await
    }

    /// 指定パスでストアを開く
    pub async fn open_at(path: PathBuf) -> CoordinatorResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| CoordinatorError::Store(format!("Failed to create data dir: {}", e)))?;
        }

        let state = if fs::try_exists(&path)
            .await
            .map_err(|e| CoordinatorError::Store(format!("Failed to stat data file: {}", e)))?
        {
            let raw = fs::read_to_string(&path)
                .await
                .map_err(|e| CoordinatorError::Store(format!("Failed to read data file: {}", e)))?;
            serde_json::from_str(&raw)
                .map_err(|e| CoordinatorError::Store(format!("Corrupt data file: {}", e)))?
        } else {
            StoreState::default()
        };

        info!("Cluster store opened at {}", path.display());

        Ok(Self {
            path,
            state: Arc::new(Mutex::new(state)),
        })
    }

    async fn persist(&self, state: &StoreState) -> CoordinatorResult<()> {
        let raw = serde_json::to_string_pretty(state)
            .map_err(|e| CoordinatorError::Store(format!("Failed to serialize state: {}", e)))?;
        fs::write(&self.path, raw)
            .await
            .map_err(|e| CoordinatorError::Store(format!("Failed to write data file: {}", e)))
    }

    /// ブートストラップレコードのアトミックな「不在時のみ作成」
    ///
    /// 返り値のboolは新規作成できたかどうか。既存レコードがある場合は
    /// それをそのまま返す（同時の初回参加者が両方ライトハウスになる
    /// 競合を防ぐ）。
    pub async fn claim_bootstrap(
        &self,
        lighthouse_address: SocketAddr,
        network_prefix: &str,
    ) -> CoordinatorResult<(bool, BootstrapRecord)> {
        let mut state = self.state.lock().await;

        if let Some(existing) = &state.bootstrap {
            return Ok((false, existing.clone()));
        }

        let record = BootstrapRecord::pending(lighthouse_address, network_prefix.to_string());
        state.bootstrap = Some(record.clone());
        self.persist(&state).await?;

        info!("Bootstrap record claimed by {}", lighthouse_address);
        Ok((true, record))
    }

    /// ライトハウス有効化（Pending→ActiveのCAS）
    ///
    /// クレームしたライトハウス以外からの有効化、および二重有効化は拒否する。
    pub async fn activate_bootstrap(
        &self,
        req: ActivateBootstrapRequest,
    ) -> CoordinatorResult<BootstrapRecord> {
        let mut state = self.state.lock().await;

        let record = state
            .bootstrap
            .as_mut()
            .ok_or_else(|| CoordinatorError::BootstrapConflict("no bootstrap record".to_string()))?;

        if record.lighthouse_address != req.lighthouse_address {
            return Err(CoordinatorError::BootstrapConflict(format!(
                "activation from {} but record claimed by {}",
                req.lighthouse_address, record.lighthouse_address
            )));
        }

        match record.status {
            BootstrapStatus::Active => {
                // 再起動したライトハウスによる再有効化は冪等に扱う
                return Ok(record.clone());
            }
            BootstrapStatus::Pending => {
                record.ca_cert_pem = Some(req.ca_cert_pem);
                record.ca_key_sealed = Some(req.ca_key_sealed);
                record.lighthouse_overlay_address = Some(req.lighthouse_overlay_address);
                record.status = BootstrapStatus::Active;
            }
        }

        let record = record.clone();
        self.persist(&state).await?;

        info!(
            "Bootstrap record activated, lighthouse overlay address {}",
            record.lighthouse_overlay_address.map(|ip| ip.to_string()).unwrap_or_default()
        );
        Ok(record)
    }

    /// 次のオーバーレイアドレスを割り当てる
    ///
    /// `next_allocatable_ip`は単調増加し、ネットワークが稼働中は再利用されない。
    pub async fn allocate_ip(&self) -> CoordinatorResult<Ipv4Addr> {
        let mut state = self.state.lock().await;

        let record = state
            .bootstrap
            .as_mut()
            .ok_or_else(|| CoordinatorError::BootstrapNotActive("no bootstrap record".to_string()))?;

        if record.status != BootstrapStatus::Active {
            return Err(CoordinatorError::BootstrapNotActive(
                "bootstrap record is pending".to_string(),
            ));
        }

        let offset = record.next_allocatable_ip;
        let address = record.overlay_ip(offset)?;
        record.next_allocatable_ip += 1;

        self.persist(&state).await?;
        Ok(address)
    }

    /// 現在のブートストラップレコードを取得
    pub async fn bootstrap(&self) -> Option<BootstrapRecord> {
        self.state.lock().await.bootstrap.clone()
    }

    /// エントリーポイントを追記（worker_id単位で冪等）
    pub async fn append_entrypoint(
        &self,
        worker_id: Uuid,
        address: SocketAddr,
    ) -> CoordinatorResult<()> {
        let mut state = self.state.lock().await;

        if let Some(existing) = state.entrypoints.iter_mut().find(|e| e.worker_id == worker_id) {
            existing.address = address;
            existing.registered_at = Utc::now();
        } else {
            state.entrypoints.push(EntryPoint {
                worker_id,
                address,
                registered_at: Utc::now(),
            });
        }

        self.persist(&state).await
    }

    /// エントリーポイント一覧
    pub async fn entrypoints(&self) -> Vec<EntryPoint> {
        self.state.lock().await.entrypoints.clone()
    }
}
