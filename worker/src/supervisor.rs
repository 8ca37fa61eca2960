//! サービススーパーバイザー
//!
//! 割り当てられたサービス種別をローカルの不透明プロセスとして起動・
//! 監視・停止する。起動コマンドは環境変数で上書きできる:
//! `FLEET_SERVICE_CMD_<NAME>`（NAMEは大文字、`-`は`_`に置換）。

use fleet_common::{
    error::{WorkerError, WorkerResult},
    types::{ServiceHealth, ServiceType},
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// 起動直後にStartingとして扱う猶予（秒）
const STARTUP_GRACE_SECS: u64 = 30;

/// ヘルスプローブのタイムアウト（秒）
const HEALTH_PROBE_TIMEOUT_SECS: u64 = 3;

struct ManagedService {
    child: Child,
    port: u16,
    started_at: Instant,
}

/// ローカルサービスプロセスの管理者
#[derive(Clone)]
pub struct ServiceSupervisor {
    catalog: Arc<Vec<ServiceType>>,
    services: Arc<Mutex<HashMap<String, ManagedService>>>,
    grace: Duration,
    http: reqwest::Client,
}

impl ServiceSupervisor {
    /// カタログと停止猶予を指定して作成
    pub fn new(catalog: Arc<Vec<ServiceType>>, service_grace_secs: u64) -> Self {
        Self {
            catalog,
            services: Arc::new(Mutex::new(HashMap::new())),
            grace: Duration::from_secs(service_grace_secs),
            http: reqwest::Client::new(),
        }
    }

    /// 割り当て一覧と実行中プロセスを一致させる
    ///
    /// 割り当てから外れたサービスは猶予つきで停止し、新たに割り当て
    /// られたサービスを起動する。起動失敗は記録して続行する。
    pub async fn reconcile(&self, assigned: &BTreeSet<String>) {
        let mut services = self.services.lock().await;

        let to_stop: Vec<String> = services
            .keys()
            .filter(|name| !assigned.contains(*name))
            .cloned()
            .collect();
        for name in to_stop {
            if let Some(managed) = services.remove(&name) {
                info!("Stopping service no longer assigned: {}", name);
                let grace = self.grace;
                tokio::spawn(async move {
                    stop_with_grace(managed.child, &name, grace).await;
                });
            }
        }

        for name in assigned {
            if services.contains_key(name) {
                continue;
            }
            let Some(service) = self.catalog.iter().find(|s| &s.name == name) else {
                warn!("Assigned service not in catalog, ignoring: {}", name);
                continue;
            };
            match spawn_service(service) {
                Ok(child) => {
                    info!("Started service {} on port {}", name, service.port);
                    services.insert(
                        name.clone(),
                        ManagedService {
                            child,
                            port: service.port,
                            started_at: Instant::now(),
                        },
                    );
                }
                Err(err) => {
                    error!("Failed to start service {}: {}", name, err);
                }
            }
        }
    }

    /// 終了したプロセスを検出して再起動する
    pub async fn restart_exited(&self) {
        let mut services = self.services.lock().await;
        let mut exited = Vec::new();

        for (name, managed) in services.iter_mut() {
            match managed.child.try_wait() {
                Ok(Some(status)) => {
                    warn!("Service {} exited with {}", name, status);
                    exited.push(name.clone());
                }
                Ok(None) => {}
                Err(err) => {
                    warn!("Failed to poll service {}: {}", name, err);
                }
            }
        }

        for name in exited {
            services.remove(&name);
            let Some(service) = self.catalog.iter().find(|s| s.name == name) else {
                continue;
            };
            match spawn_service(service) {
                Ok(child) => {
                    info!("Restarted service {}", name);
                    services.insert(
                        name,
                        ManagedService {
                            child,
                            port: service.port,
                            started_at: Instant::now(),
                        },
                    );
                }
                Err(err) => {
                    error!("Failed to restart service {}: {}", name, err);
                }
            }
        }
    }

    /// 各サービスのヘルス要約を取得する（ハートビートに載せる）
    pub async fn health_snapshot(&self) -> BTreeMap<String, ServiceHealth> {
        let probes: Vec<(String, u16, Instant)> = {
            let services = self.services.lock().await;
            services
                .iter()
                .map(|(name, managed)| (name.clone(), managed.port, managed.started_at))
                .collect()
        };

        let mut snapshot = BTreeMap::new();
        for (name, port, started_at) in probes {
            let health = match self.probe_health(port).await {
                true => ServiceHealth::Running,
                false if started_at.elapsed() < Duration::from_secs(STARTUP_GRACE_SECS) => {
                    ServiceHealth::Starting
                }
                false => ServiceHealth::Unhealthy,
            };
            snapshot.insert(name, health);
        }
        snapshot
    }

    /// 指定サービスが稼働中かどうか（プロキシ転送の前提チェック用）
    pub async fn is_managed(&self, name: &str) -> Option<u16> {
        self.services.lock().await.get(name).map(|m| m.port)
    }

    /// 全サービスを停止する（シャットダウン時）
    ///
    /// プロセス終了で`kill_on_drop`が猶予を飛ばして即killしないよう、
    /// 各サービスの停止完了まで待ってから戻る。
    pub async fn shutdown(&self) {
        let stopped: Vec<(String, Child)> = {
            let mut services = self.services.lock().await;
            services.drain().map(|(name, m)| (name, m.child)).collect()
        };
        for (name, child) in stopped {
            info!("Stopping service {}", name);
            stop_with_grace(child, &name, self.grace).await;
        }
    }

    async fn probe_health(&self, port: u16) -> bool {
        let url = format!("http://127.0.0.1:{}/health", port);
        matches!(
            self.http
                .get(&url)
                .timeout(Duration::from_secs(HEALTH_PROBE_TIMEOUT_SECS))
                .send()
                .await,
            Ok(response) if response.status().is_success()
        )
    }
}

/// サービスの起動コマンドを解決する
fn resolve_command(service: &ServiceType) -> (String, Vec<String>) {
    let env_key = format!(
        "FLEET_SERVICE_CMD_{}",
        service.name.to_uppercase().replace('-', "_")
    );
    if let Ok(command_line) = std::env::var(&env_key) {
        let mut parts = command_line.split_whitespace().map(String::from);
        if let Some(program) = parts.next() {
            return (program, parts.collect());
        }
    }
    (format!("fleet-service-{}", service.name), Vec::new())
}

fn spawn_service(service: &ServiceType) -> WorkerResult<Child> {
    let (program, args) = resolve_command(service);

    Command::new(&program)
        .args(&args)
        .env("PORT", service.port.to_string())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| WorkerError::ServiceLaunch {
            service: service.name.clone(),
            reason: format!("{} ({})", e, program),
        })
}

/// SIGTERMを送って猶予期間内の自発終了を待ち、超過したら強制終了する
async fn stop_with_grace(mut child: Child, name: &str, grace: Duration) {
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            info!("Service {} stopped with {}", name, status);
        }
        Ok(Err(err)) => {
            warn!("Failed waiting for service {}: {}", name, err);
        }
        Err(_) => {
            warn!("Service {} did not stop in time, killing", name);
            if let Err(err) = child.kill().await {
                warn!("Failed to kill service {}: {}", name, err);
            }
        }
    }
}
