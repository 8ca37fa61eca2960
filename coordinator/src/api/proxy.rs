//! サービスプロキシAPIハンドラー
//!
//! `/service/<name>/<rest>`への受信リクエストを、そのサービスを
//! 担当する健全なワーカーへ転送する。接続失敗・タイムアウト時は
//! 別の適格ワーカーに対して1回だけリトライする。

use crate::{api::worker::AppError, AppState};
use axum::{
    body::Body,
    extract::{Path, Request, State},
    http::{HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
};
use fleet_common::error::CoordinatorError;
use std::time::Duration;
use tracing::{debug, warn};

/// 転送リクエストボディの上限（バイト）
const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

/// ANY /service/:service/*rest - サービスプロキシ
pub async fn proxy_service(
    State(state): State<AppState>,
    Path((service, rest)): Path<(String, String)>,
    req: Request,
) -> Result<Response, AppError> {
    forward(state, service, rest, req).await
}

/// ANY /service/:service - パス残部なしのサービスプロキシ
pub async fn proxy_service_root(
    State(state): State<AppState>,
    Path(service): Path<String>,
    req: Request,
) -> Result<Response, AppError> {
    forward(state, service, String::new(), req).await
}

async fn forward(
    state: AppState,
    service: String,
    rest: String,
    req: Request,
) -> Result<Response, AppError> {
    let (parts, body) = req.into_parts();
    let body_bytes = axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| CoordinatorError::Internal(format!("Failed to read request body: {}", e)))?;

    let timeout = Duration::from_secs(state.config.proxy_timeout_secs);
    let query = parts.uri.query().map(|q| format!("?{}", q)).unwrap_or_default();

    // 1台目で接続失敗・タイムアウトした場合のみ、別ワーカーで1回リトライ
    let first = state.selector.select(&service, None).await?;
    match send_to_worker(
        &state,
        &first,
        &service,
        &rest,
        &query,
        parts.method.clone(),
        &parts.headers,
        body_bytes.clone(),
        timeout,
    )
    .await
    {
        Ok(response) => Ok(response),
        Err(first_error) => {
            warn!(
                service = %service,
                worker_id = %first.id,
                error = %first_error,
                "Proxy attempt failed, retrying on alternate worker"
            );

            let second = match state.selector.select(&service, Some(first.id)).await {
                Ok(worker) => worker,
                // 代替ワーカーがいなければ最初の失敗をそのまま返す
                Err(_) => return Err(first_error.into()),
            };

            send_to_worker(
                &state,
                &second,
                &service,
                &rest,
                &query,
                parts.method,
                &parts.headers,
                body_bytes,
                timeout,
            )
            .await
            .map_err(AppError::from)
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn send_to_worker(
    state: &AppState,
    worker: &fleet_common::types::Worker,
    service: &str,
    rest: &str,
    query: &str,
    method: Method,
    headers: &HeaderMap,
    body: axum::body::Bytes,
    timeout: Duration,
) -> Result<Response, CoordinatorError> {
    let url = format!(
        "http://{}/service/{}/{}{}",
        worker.network_address.socket_addr(),
        service,
        rest,
        query
    );

    debug!(url = %url, worker_id = %worker.id, "Forwarding service request");

    let mut request = state
        .http
        .request(method, &url)
        .timeout(timeout)
        .body(body.to_vec());

    for (name, value) in headers {
        // ホップバイホップヘッダーは転送しない
        if name == axum::http::header::HOST || name == axum::http::header::CONTENT_LENGTH {
            continue;
        }
        request = request.header(name, value);
    }

    let upstream = request.send().await.map_err(|e| {
        if e.is_timeout() {
            CoordinatorError::Timeout(format!("Worker {} timed out: {}", worker.id, e))
        } else {
            CoordinatorError::Http(format!("Failed to reach worker {}: {}", worker.id, e))
        }
    })?;

    // レスポンスはそのまま中継する
    let status =
        StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let headers = upstream.headers().clone();
    let bytes = upstream
        .bytes()
        .await
        .map_err(|e| CoordinatorError::Http(format!("Failed to read worker response: {}", e)))?;

    let mut response = Response::builder().status(status);
    if let Some(response_headers) = response.headers_mut() {
        for (name, value) in headers.iter() {
            if name == axum::http::header::CONTENT_LENGTH
                || name == axum::http::header::TRANSFER_ENCODING
            {
                continue;
            }
            response_headers.insert(name.clone(), value.clone());
        }
    }

    response
        .body(Body::from(bytes))
        .map_err(|e| CoordinatorError::Internal(format!("Failed to build response: {}", e)))
        .map(|r| r.into_response())
}
