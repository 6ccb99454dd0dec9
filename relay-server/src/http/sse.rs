// HLS 中继服务 - 会话状态 SSE 推送
//
// 客户端订阅后立即收到当前状态，之后每次状态变化推送一次快照；服务关闭时结束推送。

use super::routes::AppState;
use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
};
use futures::stream::{Stream, StreamExt};
use std::convert::Infallible;
use std::time::Duration;
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, error};

/// GET /api/v1/session/events
pub async fn session_events(
    State((supervisor, _, _, shutdown)): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    debug!("SSE client subscribed to session events");

    let stream = WatchStream::new(supervisor.subscribe()).map(|snapshot| {
        let event = Event::default()
            .event("session")
            .json_data(&snapshot)
            .unwrap_or_else(|e| {
                error!("Failed to serialize session snapshot: {}", e);
                Event::default().event("error").data(e.to_string())
            });
        Ok(event)
    })
    .take_until(shutdown.cancelled_owned());

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    )
}
