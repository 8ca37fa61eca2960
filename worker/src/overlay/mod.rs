//! オーバーレイネットワーク参加
//!
//! クラスター初回参加時のライトハウス選出と証明書ベースの
//! アイデンティティ確立を担う。
//!
//! - クレームに勝ったノードはCAを生成してライトハウスになる。
//!   CA秘密鍵はクラスター共有鍵で封緘したうえでCoordinatorに預ける。
//! - 負けたノードはCSRを生成し、Coordinator経由でアドレス割り当てと
//!   証明書発行を受ける。
//! - どの段階で失敗してもリレーモードへソフトフォールバックし、
//!   ノード参加自体は止めない。

use crate::client::CoordinatorClient;
use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    AeadCore, Aes256Gcm, Key, Nonce,
};
use fleet_common::{
    config::WorkerConfig,
    error::{WorkerError, WorkerResult},
    protocol::ActivateBootstrapRequest,
    types::{BootstrapStatus, LIGHTHOUSE_HOST_OFFSET},
};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, CertificateSigningRequest, DistinguishedName,
    DnType, IsCa, KeyPair, SanType,
};
use sha2::{Digest, Sha256};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tracing::{info, warn};

/// Pendingレコードに遭遇したときの再試行回数
const PENDING_RETRIES: u32 = 5;

/// Pendingレコード再試行の間隔（秒）
const PENDING_RETRY_INTERVAL_SECS: u64 = 2;

const NONCE_LEN: usize = 12;

/// 共有鍵パスフレーズからAES-256-GCM鍵を導出する
fn derive_key(cluster_secret: &str) -> Key<Aes256Gcm> {
    let digest = Sha256::digest(cluster_secret.as_bytes());
    Key::<Aes256Gcm>::clone_from_slice(&digest)
}

/// 平文をAES-256-GCMで封緘し、hex(nonce||ciphertext)を返す
pub fn seal(cluster_secret: &str, plaintext: &[u8]) -> WorkerResult<String> {
    let cipher = Aes256Gcm::new(&derive_key(cluster_secret));
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|_| WorkerError::Overlay("failed to seal key material".to_string()))?;

    let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&ciphertext);
    Ok(hex::encode(sealed))
}

/// hex(nonce||ciphertext)を開封する
pub fn open_sealed(cluster_secret: &str, sealed_hex: &str) -> WorkerResult<Vec<u8>> {
    let sealed = hex::decode(sealed_hex)
        .map_err(|_| WorkerError::Overlay("sealed payload is not valid hex".to_string()))?;
    if sealed.len() <= NONCE_LEN {
        return Err(WorkerError::Overlay("sealed payload too short".to_string()));
    }

    let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new(&derive_key(cluster_secret));
    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| WorkerError::Overlay("failed to open sealed key material".to_string()))
}

/// 確立済みのオーバーレイアイデンティティ
#[derive(Debug, Clone)]
pub struct OverlayIdentity {
    /// 割り当てられたオーバーレイアドレス
    pub address: Ipv4Addr,
    /// このノードの証明書（PEM）
    pub certificate_pem: String,
    /// このノードの秘密鍵（PEM、ディスクに書かない）
    pub key_pem: String,
    /// クラスターCA証明書（PEM）
    pub ca_cert_pem: String,
}

/// ライトハウスの署名器
///
/// CA証明書と秘密鍵を保持し、参加ノードのCSRに署名する。
/// CA鍵がこの構造体の外へ出ることはない。
pub struct LighthouseSigner {
    ca: Certificate,
    ca_cert_pem: String,
}

impl LighthouseSigner {
    /// 新しいクラスターCAを生成する
    pub fn new_cluster(network_prefix: &str) -> WorkerResult<Self> {
        let mut params = CertificateParams::new(Vec::new());
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, format!("fleet-overlay-ca {}", network_prefix));
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);

        let ca = Certificate::from_params(params)
            .map_err(|e| WorkerError::Overlay(format!("failed to generate CA: {}", e)))?;
        let ca_cert_pem = ca
            .serialize_pem()
            .map_err(|e| WorkerError::Overlay(format!("failed to serialize CA cert: {}", e)))?;

        Ok(Self { ca, ca_cert_pem })
    }

    /// 封緘済み鍵からCAを復元する（ライトハウス再起動時）
    pub fn from_sealed(
        ca_cert_pem: &str,
        ca_key_sealed: &str,
        cluster_secret: &str,
    ) -> WorkerResult<Self> {
        let key_pem_bytes = open_sealed(cluster_secret, ca_key_sealed)?;
        let key_pem = String::from_utf8(key_pem_bytes)
            .map_err(|_| WorkerError::Overlay("CA key is not valid UTF-8".to_string()))?;
        let key_pair = KeyPair::from_pem(&key_pem)
            .map_err(|e| WorkerError::Overlay(format!("failed to parse CA key: {}", e)))?;
        let params = CertificateParams::from_ca_cert_pem(ca_cert_pem, key_pair)
            .map_err(|e| WorkerError::Overlay(format!("failed to parse CA cert: {}", e)))?;
        let ca = Certificate::from_params(params)
            .map_err(|e| WorkerError::Overlay(format!("failed to restore CA: {}", e)))?;

        Ok(Self {
            ca,
            ca_cert_pem: ca_cert_pem.to_string(),
        })
    }

    /// CA証明書（PEM）
    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// CA秘密鍵を封緘して返す（Coordinatorへの預け入れ用）
    pub fn sealed_key(&self, cluster_secret: &str) -> WorkerResult<String> {
        seal(
            cluster_secret,
            self.ca.serialize_private_key_pem().as_bytes(),
        )
    }

    /// CSRに署名する
    ///
    /// CSR内の公開鍵をそのまま使い、発行対象のオーバーレイアドレスを
    /// SANに焼き込む。
    pub fn sign(&self, csr_pem: &str, overlay_address: Ipv4Addr) -> WorkerResult<String> {
        let mut csr = CertificateSigningRequest::from_pem(csr_pem)
            .map_err(|e| WorkerError::CertificateIssuance(format!("invalid CSR: {}", e)))?;
        csr.params
            .subject_alt_names
            .push(SanType::IpAddress(IpAddr::V4(overlay_address)));
        csr.serialize_pem_with_signer(&self.ca)
            .map_err(|e| WorkerError::CertificateIssuance(format!("signing failed: {}", e)))
    }
}

/// ノード自身の鍵ペアとCSRを生成する
fn generate_member_request(peer_address: SocketAddr) -> WorkerResult<(Certificate, String)> {
    let mut params = CertificateParams::new(Vec::new());
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "fleet-worker".to_string());
    params.distinguished_name = dn;
    params
        .subject_alt_names
        .push(SanType::IpAddress(peer_address.ip()));

    let certificate = Certificate::from_params(params)
        .map_err(|e| WorkerError::Overlay(format!("failed to generate keypair: {}", e)))?;
    let csr_pem = certificate
        .serialize_request_pem()
        .map_err(|e| WorkerError::Overlay(format!("failed to serialize CSR: {}", e)))?;
    Ok((certificate, csr_pem))
}

/// オーバーレイ参加の結果
pub enum OverlayRole {
    /// このノードがライトハウスとして稼働する
    Lighthouse {
        /// 確立したアイデンティティ
        identity: OverlayIdentity,
        /// ピアAPIで使用する署名器
        signer: LighthouseSigner,
    },
    /// 既存オーバーレイの参加メンバー
    Member {
        /// 確立したアイデンティティ
        identity: OverlayIdentity,
    },
    /// 参加できず、リレーアドレスで運用する
    Relay,
}

/// オーバーレイ参加フローを実行する
///
/// 失敗はすべて`OverlayRole::Relay`に落とし、エラーとしては返さない。
/// 設定や入力の問題でそもそも試行できない場合のみErrを返す。
pub async fn establish(
    client: &CoordinatorClient,
    config: &WorkerConfig,
    peer_address: SocketAddr,
) -> WorkerResult<OverlayRole> {
    let claim = match client.claim_bootstrap(peer_address).await {
        Ok(claim) => claim,
        Err(error) => {
            warn!("Bootstrap claim failed, staying in relay mode: {}", error);
            return Ok(OverlayRole::Relay);
        }
    };

    if claim.claimed {
        return match become_lighthouse(client, config, peer_address, &claim.record.network_prefix)
            .await
        {
            Ok(role) => Ok(role),
            Err(error) => {
                warn!("Lighthouse initialization failed, staying in relay mode: {}", error);
                Ok(OverlayRole::Relay)
            }
        };
    }

    // 既存レコードあり。Activeになるまで限定的に待つ
    let mut record = claim.record;
    let mut retries = 0;
    while record.status == BootstrapStatus::Pending {
        if retries >= PENDING_RETRIES {
            warn!("Bootstrap record stuck in pending state, staying in relay mode");
            return Ok(OverlayRole::Relay);
        }
        retries += 1;
        tokio::time::sleep(Duration::from_secs(PENDING_RETRY_INTERVAL_SECS)).await;
        record = match client.claim_bootstrap(peer_address).await {
            Ok(claim) => claim.record,
            Err(error) => {
                warn!("Bootstrap poll failed, staying in relay mode: {}", error);
                return Ok(OverlayRole::Relay);
            }
        };
    }

    match join_as_member(client, peer_address).await {
        Ok(identity) => Ok(OverlayRole::Member { identity }),
        Err(error) => {
            warn!("Overlay join failed, staying in relay mode: {}", error);
            Ok(OverlayRole::Relay)
        }
    }
}

/// クレームに勝ったノードのライトハウス初期化
async fn become_lighthouse(
    client: &CoordinatorClient,
    config: &WorkerConfig,
    peer_address: SocketAddr,
    network_prefix: &str,
) -> WorkerResult<OverlayRole> {
    let signer = LighthouseSigner::new_cluster(network_prefix)?;

    // ライトハウス自身の証明書もCAで発行する
    let (member_cert, csr_pem) = generate_member_request(peer_address)?;
    let record = fleet_common::types::BootstrapRecord::pending(
        peer_address,
        network_prefix.to_string(),
    );
    let overlay_address = record.overlay_ip(LIGHTHOUSE_HOST_OFFSET)?;
    let certificate_pem = signer.sign(&csr_pem, overlay_address)?;

    client
        .activate_bootstrap(&ActivateBootstrapRequest {
            lighthouse_address: peer_address,
            ca_cert_pem: signer.ca_cert_pem().to_string(),
            ca_key_sealed: signer.sealed_key(&config.cluster_secret)?,
            lighthouse_overlay_address: overlay_address,
        })
        .await?;

    info!("Acting as overlay lighthouse at {}", overlay_address);

    Ok(OverlayRole::Lighthouse {
        identity: OverlayIdentity {
            address: overlay_address,
            certificate_pem,
            key_pem: member_cert.serialize_private_key_pem(),
            ca_cert_pem: signer.ca_cert_pem().to_string(),
        },
        signer,
    })
}

/// 参加側の証明書取得
async fn join_as_member(
    client: &CoordinatorClient,
    peer_address: SocketAddr,
) -> WorkerResult<OverlayIdentity> {
    let (member_cert, csr_pem) = generate_member_request(peer_address)?;
    let allocation = client.allocate(csr_pem).await?;

    info!("Joined overlay network at {}", allocation.address);

    Ok(OverlayIdentity {
        address: allocation.address,
        certificate_pem: allocation.certificate_pem,
        key_pem: member_cert.serialize_private_key_pem(),
        ca_cert_pem: allocation.ca_cert_pem,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_roundtrip() {
        let sealed = seal("cluster-secret", b"private key material").unwrap();
        let opened = open_sealed("cluster-secret", &sealed).unwrap();
        assert_eq!(opened, b"private key material");
    }

    #[test]
    fn test_open_with_wrong_secret_fails() {
        let sealed = seal("cluster-secret", b"private key material").unwrap();
        assert!(open_sealed("other-secret", &sealed).is_err());
    }

    #[test]
    fn test_seal_is_randomized() {
        let a = seal("cluster-secret", b"payload").unwrap();
        let b = seal("cluster-secret", b"payload").unwrap();
        // nonceが毎回変わるため同じ平文でも暗号文は異なる
        assert_ne!(a, b);
    }

    #[test]
    fn test_open_rejects_garbage() {
        assert!(open_sealed("secret", "zz-not-hex").is_err());
        assert!(open_sealed("secret", "0011").is_err());
    }

    #[test]
    fn test_lighthouse_signs_member_csr() {
        let signer = LighthouseSigner::new_cluster("10.42.0.0/16").unwrap();
        let (_, csr_pem) = generate_member_request("192.168.1.5:7171".parse().unwrap()).unwrap();

        let cert_pem = signer.sign(&csr_pem, Ipv4Addr::new(10, 42, 0, 2)).unwrap();
        assert!(cert_pem.contains("BEGIN CERTIFICATE"));
    }

    #[test]
    fn test_signer_restores_from_sealed_key() {
        let signer = LighthouseSigner::new_cluster("10.42.0.0/16").unwrap();
        let sealed = signer.sealed_key("cluster-secret").unwrap();

        let restored =
            LighthouseSigner::from_sealed(signer.ca_cert_pem(), &sealed, "cluster-secret").unwrap();

        let (_, csr_pem) = generate_member_request("192.168.1.6:7171".parse().unwrap()).unwrap();
        assert!(restored.sign(&csr_pem, Ipv4Addr::new(10, 42, 0, 3)).is_ok());
    }

    #[test]
    fn test_signer_rejects_invalid_csr() {
        let signer = LighthouseSigner::new_cluster("10.42.0.0/16").unwrap();
        assert!(signer.sign("not a csr", Ipv4Addr::new(10, 42, 0, 2)).is_err());
    }
}
