//! エラー型定義
//!
//! 統一エラー型（thiserror使用）

use thiserror::Error;
use uuid::Uuid;

/// Common layer error type
#[derive(Debug, Error)]
pub enum CommonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Address parse error
    #[error("Address parse error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Cryptographic error
    #[error("Crypto error: {0}")]
    Crypto(String),
}

/// Coordinator error type
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// Common layer error
    #[error(transparent)]
    Common(#[from] CommonError),

    /// Worker not found (caller must re-register)
    #[error("Worker not found: {0}")]
    WorkerNotFound(Uuid),

    /// No eligible worker for a service
    #[error("No eligible worker for service: {0}")]
    NoWorkersAvailable(String),

    /// Bootstrap record state conflict
    #[error("Bootstrap conflict: {0}")]
    BootstrapConflict(String),

    /// Bootstrap record missing or not active
    #[error("Bootstrap not active: {0}")]
    BootstrapNotActive(String),

    /// Durable store error
    #[error("Store error: {0}")]
    Store(String),

    /// Upstream HTTP error
    #[error("HTTP error: {0}")]
    Http(String),

    /// Timeout error
    #[error("Timeout error: {0}")]
    Timeout(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Worker agent error type
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Common layer error
    #[error(transparent)]
    Common(#[from] CommonError),

    /// Capability probe error
    #[error("Capability probe failed: {0}")]
    Probe(String),

    /// Registration error (retried with backoff, never fatal)
    #[error("Registration failed: {0}")]
    Registration(String),

    /// Heartbeat send error
    #[error("Failed to send heartbeat: {0}")]
    Heartbeat(String),

    /// Heartbeat rejected: identity unknown to the coordinator.
    /// Forces a full re-registration with a fresh identity.
    #[error("Heartbeat rejected: worker id unknown to coordinator")]
    HeartbeatRejected,

    /// Overlay join error (soft dependency, agent continues in relay mode)
    #[error("Overlay join failed: {0}")]
    Overlay(String),

    /// Certificate issuance error
    #[error("Certificate issuance failed: {0}")]
    CertificateIssuance(String),

    /// Local service launch error
    #[error("Service launch failed for {service}: {reason}")]
    ServiceLaunch {
        /// サービス名
        service: String,
        /// 失敗理由
        reason: String,
    },

    /// DHT operation error (falls back to coordinator routing)
    #[error("DHT operation failed: {0}")]
    Dht(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias (Common)
pub type CommonResult<T> = Result<T, CommonError>;

/// Result type alias (Coordinator)
pub type CoordinatorResult<T> = Result<T, CoordinatorError>;

/// Result type alias (Worker)
pub type WorkerResult<T> = Result<T, WorkerError>;
