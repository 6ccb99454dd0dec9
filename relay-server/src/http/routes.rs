use crate::publisher::OutputPublisher;
use crate::session::SessionSupervisor;
use axum::{
    http::{header, HeaderValue},
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

/// 路由共享状态：会话管理器、输出发布器、默认频道、关闭信号
pub type AppState = (SessionSupervisor, OutputPublisher, Arc<String>, CancellationToken);

pub fn create_router(
    supervisor: SessionSupervisor,
    publisher: OutputPublisher,
    default_channel: String,
    hls_prefix: &str,
    shutdown: CancellationToken,
) -> Router {
    // manifest 持续更新，禁止播放器缓存
    let hls_files = ServiceBuilder::new()
        .layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-cache"),
        ))
        .service(ServeDir::new(publisher.output_dir().clone()));

    Router::new()
        // 播放地址查询
        .route("/stream-url", get(super::handlers::stream_url))

        // 会话管理
        .route("/api/v1/session", get(super::handlers::get_session))
        .route("/api/v1/session/start", post(super::handlers::start_session))
        .route("/api/v1/session/stop", post(super::handlers::stop_session))
        .route("/api/v1/session/events", get(super::sse::session_events))

        // 健康检查
        .route("/health", get(super::handlers::health_check))

        .with_state((supervisor, publisher, Arc::new(default_channel), shutdown))

        // HLS 输出目录
        .nest_service(hls_prefix, hls_files)

        .layer(TraceLayer::new_for_http())
        // CORS中间件
        .layer(CorsLayer::permissive())
}
