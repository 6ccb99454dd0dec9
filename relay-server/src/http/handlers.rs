use super::routes::AppState;
use crate::publisher::ManifestStatus;
use axum::{extract::State, http::StatusCode, Json};
use common::{RelayError, SessionSnapshot};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

#[derive(Serialize)]
pub struct ApiResponse<T> {
    status: String,
    data: Option<T>,
    error: Option<String>,
}

impl<T> ApiResponse<T> {
    fn success(data: T) -> Self {
        Self {
            status: "success".to_string(),
            data: Some(data),
            error: None,
        }
    }

    fn error(message: String) -> Self {
        Self {
            status: "error".to_string(),
            data: None,
            error: Some(message),
        }
    }
}

type ApiError = (StatusCode, Json<ApiResponse<()>>);

/// 错误到 HTTP 状态码的映射
fn error_status(error: &RelayError) -> StatusCode {
    match error {
        RelayError::Conflict { .. } => StatusCode::CONFLICT,
        RelayError::NotFound(_) => StatusCode::NOT_FOUND,
        RelayError::Fetch(_) | RelayError::ValidationFailed { .. } => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn api_error(error: RelayError) -> ApiError {
    (error_status(&error), Json(ApiResponse::error(error.to_string())))
}

/// 健康检查
pub async fn health_check() -> Json<ApiResponse<String>> {
    Json(ApiResponse::success("OK".to_string()))
}

/// 查询 manifest 地址
///
/// 就绪时返回 `{"url": ...}`；未就绪返回 503 和当前状态，客户端应轮询。
pub async fn stream_url(
    State((_, publisher, _, _)): State<AppState>,
) -> (StatusCode, Json<serde_json::Value>) {
    match publisher.current_manifest_url().await {
        ManifestStatus::Ready { url } => (StatusCode::OK, Json(json!({ "url": url }))),
        ManifestStatus::NotReady { state } => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "url": null, "state": state })),
        ),
    }
}

/// 获取会话状态
pub async fn get_session(
    State((supervisor, _, _, _)): State<AppState>,
) -> Json<ApiResponse<SessionSnapshot>> {
    Json(ApiResponse::success(supervisor.snapshot()))
}

#[derive(Debug, Default, Deserialize)]
pub struct StartSessionRequest {
    /// 不指定时使用配置中的频道
    channel: Option<String>,
}

#[derive(Serialize)]
pub struct StartSessionResponse {
    session_id: String,
    channel: String,
    manifest_url: String,
}

/// 启动会话
///
/// 启动流程在后台执行，立即返回 202；通过会话状态或 /stream-url 查询进度。
pub async fn start_session(
    State((supervisor, publisher, default_channel, _)): State<AppState>,
    request: Option<Json<StartSessionRequest>>,
) -> Result<(StatusCode, Json<ApiResponse<StartSessionResponse>>), ApiError> {
    let request = request.map(|Json(r)| r).unwrap_or_default();
    let channel = request
        .channel
        .filter(|c| !c.trim().is_empty())
        .unwrap_or_else(|| default_channel.as_ref().clone());

    let handle = supervisor.start(&channel).map_err(|e| {
        warn!("Start request rejected: {}", e);
        api_error(e)
    })?;

    Ok((
        StatusCode::ACCEPTED,
        Json(ApiResponse::success(StartSessionResponse {
            session_id: handle.session_id.to_string(),
            channel,
            manifest_url: publisher.manifest_url().to_string(),
        })),
    ))
}

/// 停止会话，等待转码进程退出后返回最终状态
pub async fn stop_session(
    State((supervisor, _, _, _)): State<AppState>,
) -> Json<ApiResponse<SessionSnapshot>> {
    Json(ApiResponse::success(supervisor.stop().await))
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::SessionState;

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(
            error_status(&RelayError::Conflict { state: SessionState::Running }),
            StatusCode::CONFLICT
        );
        assert_eq!(error_status(&RelayError::NotFound("x".into())), StatusCode::NOT_FOUND);
        assert_eq!(error_status(&RelayError::Fetch("x".into())), StatusCode::BAD_GATEWAY);
        assert_eq!(
            error_status(&RelayError::ValidationFailed { status: Some(403), reason: String::new() }),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            error_status(&RelayError::ProcessStart("x".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
