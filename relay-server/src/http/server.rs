use crate::publisher::OutputPublisher;
use crate::session::SessionSupervisor;
use common::Result;
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// 本地 HTTP 服务
#[derive(Clone)]
pub struct RelayServer {
    addr: SocketAddr,
    supervisor: SessionSupervisor,
    publisher: OutputPublisher,
    default_channel: String,
    hls_prefix: String,
    shutdown: CancellationToken,
}

impl RelayServer {
    pub fn new(
        addr: SocketAddr,
        supervisor: SessionSupervisor,
        publisher: OutputPublisher,
        default_channel: String,
        hls_prefix: String,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            addr,
            supervisor,
            publisher,
            default_channel,
            hls_prefix,
            shutdown,
        }
    }

    /// 运行直到关闭信号被触发
    pub async fn run(&self) -> Result<()> {
        let app = super::routes::create_router(
            self.supervisor.clone(),
            self.publisher.clone(),
            self.default_channel.clone(),
            &self.hls_prefix,
            self.shutdown.clone(),
        );

        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        info!("✓ HTTP server listening on http://{}", listener.local_addr()?);

        axum::serve(listener, app)
            .with_graceful_shutdown(self.shutdown.clone().cancelled_owned())
            .await?;

        Ok(())
    }
}
