//! サービスプロキシのHTTP経路テスト

mod support;

use axum::{
    extract::{Path, RawQuery},
    routing::any,
    Json, Router,
};
use reqwest::Client;
use serde_json::json;
use support::coordinator::{register_worker, spawn_coordinator};
use support::http::{spawn_router, TestServer};

/// ワーカーのピアAPIを模したスタブ（受けたパスとクエリを返す）
async fn spawn_stub_worker() -> TestServer {
    async fn echo(
        Path((service, rest)): Path<(String, String)>,
        RawQuery(query): RawQuery,
        body: String,
    ) -> Json<serde_json::Value> {
        Json(json!({
            "service": service,
            "rest": rest,
            "query": query,
            "body": body,
        }))
    }

    let router = Router::new().route("/service/:service/*rest", any(echo));
    spawn_router(router).await
}

#[tokio::test]
async fn test_proxy_forwards_to_assigned_worker() {
    let coordinator = spawn_coordinator().await;
    let stub = spawn_stub_worker().await;

    register_worker(coordinator.addr(), stub.addr(), true).await;

    let response = Client::new()
        .post(coordinator.url("/service/note-convert/v1/convert?format=md"))
        .body("hello")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["service"], "note-convert");
    assert_eq!(body["rest"], "v1/convert");
    assert_eq!(body["query"], "format=md");
    assert_eq!(body["body"], "hello");

    stub.stop().await;
    coordinator.server.stop().await;
}

#[tokio::test]
async fn test_proxy_without_workers_is_service_unavailable() {
    let coordinator = spawn_coordinator().await;

    let response = Client::new()
        .get(coordinator.url("/service/note-convert/v1/convert"))
        .send()
        .await
        .unwrap();

    // 適格ワーカー不在は503で、ボディでルーティングバグと区別できる
    assert_eq!(response.status(), 503);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"]["type"], "no_eligible_worker");

    coordinator.server.stop().await;
}

#[tokio::test]
async fn test_proxy_unknown_service_is_service_unavailable() {
    let coordinator = spawn_coordinator().await;
    let stub = spawn_stub_worker().await;
    register_worker(coordinator.addr(), stub.addr(), true).await;

    let response = Client::new()
        .get(coordinator.url("/service/no-such-service/run"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 503);

    stub.stop().await;
    coordinator.server.stop().await;
}

#[tokio::test]
async fn test_proxy_retries_on_unreachable_worker() {
    let coordinator = spawn_coordinator().await;
    let stub = spawn_stub_worker().await;

    // 到達不能なワーカー（バインドだけして閉じたポート）と正常ワーカー
    let dead_addr = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };
    register_worker(coordinator.addr(), dead_addr, true).await;
    register_worker(coordinator.addr(), stub.addr(), true).await;

    // どちらのワーカーが先に選ばれても、リトライで成功に収束する
    for _ in 0..4 {
        let response = Client::new()
            .get(coordinator.url("/service/note-convert/v1/status"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
    }

    stub.stop().await;
    coordinator.server.stop().await;
}

#[tokio::test]
async fn test_proxy_relays_upstream_status() {
    let coordinator = spawn_coordinator().await;

    async fn teapot() -> (axum::http::StatusCode, &'static str) {
        (axum::http::StatusCode::IM_A_TEAPOT, "short and stout")
    }
    let router = Router::new().route("/service/:service/*rest", any(teapot));
    let stub = spawn_router(router).await;

    register_worker(coordinator.addr(), stub.addr(), true).await;

    let response = Client::new()
        .get(coordinator.url("/service/note-convert/brew"))
        .send()
        .await
        .unwrap();

    // 上流のステータスとボディは書き換えずに中継する
    assert_eq!(response.status(), 418);
    assert_eq!(response.text().await.unwrap(), "short and stout");

    coordinator.server.stop().await;
    stub.stop().await;
}
